use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use parley_core::config::{EndpointArgs, EndpointConfig};
use parley_core::engine::webrtc::WebRtcEngine;
use parley_core::signaling::RelayChannel;
use parley_core::telemetry::{self, LogConfig, LogLevel};
use parley_core::{CallCommand, CallSession, CallStatus, NegotiatorState, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "parley", version, about = "Two-party WebRTC call endpoint")]
struct Cli {
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Place a call as soon as media and the relay are ready
    #[arg(long)]
    call: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Let webrtc and websocket internals log at the chosen level too
    #[arg(long, env = "PARLEY_TRACE_DEPS")]
    trace_deps: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = telemetry::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
        dependency_traces: cli.trace_deps,
    })?;

    let config = EndpointConfig::try_from(cli.endpoint).context("invalid endpoint settings")?;
    tracing::info!(
        relay = %config.relay_url,
        ice_servers = config.ice_servers.len(),
        audio = config.constraints.audio,
        video = config.constraints.video,
        "starting endpoint"
    );

    let engine = WebRtcEngine::new(config.ice_servers.clone(), config.constraints)?;
    let link = RelayChannel::connect(&config.relay_url, config.reconnect)?;
    let (session, handle) = CallSession::new(
        engine,
        link,
        SessionConfig {
            negotiation_timeout: config.negotiation_timeout,
        },
    );

    let commands = handle.commands;
    let status = handle.status;
    tokio::spawn(report_status(status.clone()));
    if cli.call {
        tokio::spawn(call_when_ready(status.clone(), commands.clone()));
    }

    let mut driver = tokio::spawn(session.run());
    tokio::select! {
        finished = &mut driver => {
            finished?.context("call session failed")?;
            return Ok(());
        }
        input = read_commands(commands.clone(), status) => input?,
        _ = tokio::signal::ctrl_c() => {}
    }

    let _ = commands.send(CallCommand::Shutdown);
    driver.await?.context("call session failed")?;
    Ok(())
}

async fn read_commands(
    commands: mpsc::UnboundedSender<CallCommand>,
    status: watch::Receiver<CallStatus>,
) -> Result<()> {
    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match line.trim() {
            "call" | "start" => CallCommand::StartCall,
            "end" | "hangup" => CallCommand::EndCall,
            "toggle" => CallCommand::Toggle,
            "status" => {
                print_status(&status.borrow());
                continue;
            }
            "quit" | "exit" => break,
            "" => continue,
            "help" => {
                print_help();
                continue;
            }
            other => {
                println!("unknown command `{other}` (try `help`)");
                continue;
            }
        };
        if commands.send(command).is_err() {
            break;
        }
    }
    Ok(())
}

async fn report_status(mut status: watch::Receiver<CallStatus>) {
    let mut last_state = None;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if last_state != Some(current.state) {
            print_status(&current);
            last_state = Some(current.state);
        }
    }
}

async fn call_when_ready(
    mut status: watch::Receiver<CallStatus>,
    commands: mpsc::UnboundedSender<CallCommand>,
) {
    let ready = status
        .wait_for(|s| s.state == NegotiatorState::Ready && s.channel_connected)
        .await
        .is_ok();
    if ready {
        let _ = commands.send(CallCommand::StartCall);
    }
}

fn print_status(status: &CallStatus) {
    println!(
        "[{}] relay {} | local: {} | remote: {} | [{}]",
        status.state,
        if status.channel_connected { "up" } else { "down" },
        status.local_surface(),
        status.remote_surface(),
        status.toggle_label(),
    );
    if let Some(err) = &status.last_error {
        println!("  last error: {err}");
    }
}

fn print_help() {
    println!("commands: call | end | toggle | status | quit");
}
