//! Subscriber setup for the endpoint binary.
//!
//! Events go through a non-blocking writer to stderr or an append-only file,
//! leaving stdout to the command prompt. Hold on to the guard [`init`]
//! returns; dropping it flushes and stops the writer.

use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::ParseError;

/// Replaces the computed filter when set, e.g.
/// `PARLEY_LOG_FILTER=warn,parley_core::signaling=trace`.
pub const FILTER_ENV: &str = "PARLEY_LOG_FILTER";

const OWN_TARGETS: &[&str] = &["parley", "parley_core"];

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Let webrtc, ICE and websocket internals log below info as well.
    pub dependency_traces: bool,
}

impl LogConfig {
    /// Our own targets follow `level`. Everything else is held at info
    /// unless `level` is quieter or dependency traces were asked for.
    fn directives(&self) -> Vec<String> {
        let level = LevelFilter::from(self.level);
        let ambient = if self.dependency_traces {
            level
        } else {
            level.min(LevelFilter::INFO)
        };
        let mut directives = vec![ambient.to_string()];
        directives.extend(OWN_TARGETS.iter().map(|target| format!("{target}={level}")));
        directives
    }

    pub fn filter(&self) -> Result<EnvFilter, ParseError> {
        EnvFilter::builder().parse(self.directives().join(","))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),
    #[error("a global subscriber is already installed")]
    AlreadyInstalled,
}

pub fn init(config: &LogConfig) -> Result<WorkerGuard, InitError> {
    let filter = match std::env::var(FILTER_ENV) {
        Ok(raw) => EnvFilter::try_new(raw)?,
        Err(_) => config.filter()?,
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let verbose = matches!(config.level, LogLevel::Debug | LogLevel::Trace);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|_| InitError::AlreadyInstalled)?;
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel, dependency_traces: bool) -> LogConfig {
        LogConfig {
            level,
            file: None,
            dependency_traces,
        }
    }

    #[test_timeout::timeout]
    fn debug_stays_on_our_own_targets() {
        assert_eq!(
            config(LogLevel::Debug, false).directives(),
            ["info", "parley=debug", "parley_core=debug"]
        );
    }

    #[test_timeout::timeout]
    fn dependency_traces_lift_the_ambient_level() {
        let directives = config(LogLevel::Trace, true).directives();
        assert_eq!(directives[0], "trace");
        assert!(config(LogLevel::Trace, true).filter().is_ok());
    }

    #[test_timeout::timeout]
    fn quiet_levels_apply_everywhere() {
        assert_eq!(
            config(LogLevel::Warn, false).directives(),
            ["warn", "parley=warn", "parley_core=warn"]
        );
    }
}
