use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A frame exactly as received from the sending channel.
pub type Frame = Arc<str>;

/// Per-connection identity. Lives only as long as the WebSocket does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// How a channel takes part in the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// A calling endpoint: its frames are fanned out and its departure is
    /// announced.
    Endpoint,
    /// Receives the fan-out and nothing else. Observers do not count
    /// towards the channel cap.
    Observer,
}

struct ChannelEntry {
    tx: mpsc::Sender<Frame>,
    role: ChannelRole,
    dropped: AtomicU64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("relay already has {0} endpoint channels")]
    Full(usize),
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

/// Registry of live channels.
///
/// Holds no session state: only the set of connected channels and a bounded
/// outbound queue per channel. Safe to register and deregister while
/// broadcasts are in flight.
#[derive(Clone)]
pub struct Relay {
    channels: Arc<DashMap<ChannelId, ChannelEntry>>,
    endpoints: Arc<AtomicUsize>,
    buffer: usize,
}

impl Relay {
    pub fn new(buffer: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            endpoints: Arc::new(AtomicUsize::new(0)),
            buffer: buffer.max(1),
        }
    }

    /// Registers a channel and hands back the receiving end of its queue.
    pub fn register(&self, id: ChannelId, role: ChannelRole) -> mpsc::Receiver<Frame> {
        if role == ChannelRole::Endpoint {
            self.endpoints.fetch_add(1, Ordering::AcqRel);
        }
        self.insert(id, role)
    }

    /// Like [`Relay::register`] but refuses an endpoint once `max` endpoints
    /// are live. The slot is reserved before the channel is inserted, so
    /// concurrent upgrades cannot overshoot the cap.
    pub fn try_register(
        &self,
        id: ChannelId,
        role: ChannelRole,
        max: Option<usize>,
    ) -> Result<mpsc::Receiver<Frame>, RegisterError> {
        let (Some(max), ChannelRole::Endpoint) = (max, role) else {
            return Ok(self.register(id, role));
        };
        self.endpoints
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < max).then_some(live + 1)
            })
            .map_err(|_| RegisterError::Full(max))?;
        Ok(self.insert(id, role))
    }

    fn insert(&self, id: ChannelId, role: ChannelRole) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.channels.insert(
            id,
            ChannelEntry {
                tx,
                role,
                dropped: AtomicU64::new(0),
            },
        );
        rx
    }

    /// Removes `id` and returns the role it was registered with.
    pub fn deregister(&self, id: ChannelId) -> Option<ChannelRole> {
        let (_, entry) = self.channels.remove(&id)?;
        if entry.role == ChannelRole::Endpoint {
            self.endpoints.fetch_sub(1, Ordering::AcqRel);
        }
        let dropped = entry.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            debug!(channel = %id, dropped, "channel deregistered with dropped frames");
        }
        Some(entry.role)
    }

    /// Every live channel, observers included.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn endpoints(&self) -> usize {
        self.endpoints.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Delivers `frame` to every registered channel except `sender`.
    ///
    /// Never waits on a receiver: a channel whose queue is full loses this
    /// frame and the sender carries on.
    pub fn broadcast_except(&self, sender: ChannelId, frame: Frame) -> Delivery {
        let mut delivery = Delivery::default();
        for entry in self.channels.iter() {
            if *entry.key() == sender {
                continue;
            }
            match entry.value().tx.try_send(Arc::clone(&frame)) {
                Ok(()) => delivery.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let total = entry.value().dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        channel = %entry.key(),
                        from = %sender,
                        total_dropped = total,
                        "outbound queue saturated; dropping frame"
                    );
                    delivery.dropped += 1;
                }
                // Writer already gone; the reader side will deregister it shortly.
                Err(mpsc::error::TrySendError::Closed(_)) => delivery.dropped += 1,
            }
        }
        delivery
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[test_timeout::timeout]
    fn fan_out_skips_sender() {
        let relay = Relay::new(8);
        let ids: Vec<ChannelId> = (0..4).map(|_| ChannelId::generate()).collect();
        let mut queues: Vec<_> = ids
            .iter()
            .map(|id| relay.register(*id, ChannelRole::Endpoint))
            .collect();

        let delivery = relay.broadcast_except(ids[1], frame("offer"));
        assert_eq!(delivery, Delivery { delivered: 3, dropped: 0 });

        for (index, queue) in queues.iter_mut().enumerate() {
            let received = queue.try_recv().ok();
            if index == 1 {
                assert!(received.is_none(), "sender must not hear its own frame");
            } else {
                assert_eq!(received.as_deref(), Some("offer"));
            }
        }
    }

    #[test_timeout::timeout]
    fn preserves_per_sender_order() {
        let relay = Relay::new(8);
        let a = ChannelId::generate();
        let b = ChannelId::generate();
        let _a_rx = relay.register(a, ChannelRole::Endpoint);
        let mut b_rx = relay.register(b, ChannelRole::Endpoint);

        for text in ["c1", "c2", "c3"] {
            relay.broadcast_except(a, frame(text));
        }
        let got: Vec<String> = std::iter::from_fn(|| b_rx.try_recv().ok())
            .map(|f| f.to_string())
            .collect();
        assert_eq!(got, vec!["c1", "c2", "c3"]);
    }

    #[test_timeout::timeout]
    fn saturated_receiver_drops_without_blocking_others() {
        let relay = Relay::new(1);
        let sender = ChannelId::generate();
        let slow = ChannelId::generate();
        let fast = ChannelId::generate();
        let _sender_rx = relay.register(sender, ChannelRole::Endpoint);
        let mut slow_rx = relay.register(slow, ChannelRole::Endpoint);
        let mut fast_rx = relay.register(fast, ChannelRole::Endpoint);

        assert_eq!(relay.broadcast_except(sender, frame("one")).delivered, 2);
        // Drain the fast side only; the slow queue stays full.
        assert_eq!(fast_rx.try_recv().ok().as_deref(), Some("one"));

        let second = relay.broadcast_except(sender, frame("two"));
        assert_eq!(second, Delivery { delivered: 1, dropped: 1 });
        assert_eq!(fast_rx.try_recv().ok().as_deref(), Some("two"));
        assert_eq!(slow_rx.try_recv().ok().as_deref(), Some("one"));
        assert!(slow_rx.try_recv().is_err());
    }

    #[test_timeout::timeout]
    fn late_joiner_sees_only_future_frames() {
        let relay = Relay::new(8);
        let a = ChannelId::generate();
        let b = ChannelId::generate();
        let _a_rx = relay.register(a, ChannelRole::Endpoint);
        let _b_rx = relay.register(b, ChannelRole::Endpoint);
        relay.broadcast_except(a, frame("early"));

        let late = ChannelId::generate();
        let mut late_rx = relay.register(late, ChannelRole::Endpoint);
        assert!(late_rx.try_recv().is_err());

        relay.broadcast_except(a, frame("later"));
        assert_eq!(late_rx.try_recv().ok().as_deref(), Some("later"));
    }

    #[test_timeout::timeout]
    fn deregistered_channel_receives_nothing() {
        let relay = Relay::new(8);
        let a = ChannelId::generate();
        let b = ChannelId::generate();
        let _a_rx = relay.register(a, ChannelRole::Endpoint);
        let mut b_rx = relay.register(b, ChannelRole::Endpoint);

        assert_eq!(relay.deregister(b), Some(ChannelRole::Endpoint));
        assert_eq!(relay.deregister(b), None);
        assert_eq!(relay.broadcast_except(a, frame("x")).delivered, 0);
        assert!(b_rx.try_recv().is_err());
        assert_eq!(relay.len(), 1);
    }

    #[test_timeout::timeout]
    fn capacity_limit_refuses_extra_endpoints() {
        let relay = Relay::new(8);
        let cap = Some(2);
        let a = ChannelId::generate();
        let _a = relay.try_register(a, ChannelRole::Endpoint, cap).unwrap();
        let _b = relay
            .try_register(ChannelId::generate(), ChannelRole::Endpoint, cap)
            .unwrap();
        assert_eq!(
            relay
                .try_register(ChannelId::generate(), ChannelRole::Endpoint, cap)
                .err(),
            Some(RegisterError::Full(2))
        );
        // Observers never take an endpoint slot.
        let _tap = relay
            .try_register(ChannelId::generate(), ChannelRole::Observer, cap)
            .unwrap();
        assert_eq!((relay.len(), relay.endpoints()), (3, 2));

        relay.deregister(a);
        assert!(relay
            .try_register(ChannelId::generate(), ChannelRole::Endpoint, cap)
            .is_ok());
        assert!(relay
            .try_register(ChannelId::generate(), ChannelRole::Endpoint, None)
            .is_ok());
    }

    #[test_timeout::timeout]
    fn concurrent_registrations_never_overshoot_the_cap() {
        let relay = Relay::new(8);
        let barrier = std::sync::Barrier::new(16);
        let admitted: Vec<_> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        relay
                            .try_register(ChannelId::generate(), ChannelRole::Endpoint, Some(4))
                            .ok()
                    })
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|worker| worker.join().unwrap())
                .collect()
        });
        assert_eq!(admitted.len(), 4);
        assert_eq!(relay.endpoints(), 4);
        assert_eq!(relay.len(), 4);
    }
}
