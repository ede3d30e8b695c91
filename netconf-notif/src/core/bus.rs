//! Live event bus.
//!
//! Carries `(timestamp, payload)` tuples between publishers and
//! subscribers under D-Bus style `(interface, path, member)` addresses,
//! one path per stream. Delivery is FIFO per publisher, nothing is
//! persisted, and messages published while nobody listens are dropped.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::{NtfError, Result};

/// Interface carried by every event signal
pub const BUS_INTERFACE: &str = "libnetconf.notifications.stream";

/// Object path prefix; the stream name is the last path segment
pub const BUS_PATH_PREFIX: &str = "/libnetconf/notifications/stream";

/// Member name of the event signal
pub const BUS_MEMBER_EVENT: &str = "Event";

/// Buffered signals per subscription before a slow consumer starts lagging
const BUS_QUEUE_DEPTH: usize = 1024;

/// Address of a bus signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusAddress {
    pub interface: String,
    pub path: String,
    pub member: String,
}

impl BusAddress {
    /// Address of the `Event` signal for one stream
    pub fn event_for_stream(stream: &str) -> Self {
        Self {
            interface: BUS_INTERFACE.to_string(),
            path: format!("{BUS_PATH_PREFIX}/{stream}"),
            member: BUS_MEMBER_EVENT.to_string(),
        }
    }
}

/// Subscriber-side interest expression over the address triple. An unset
/// field matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub interface: Option<String>,
    pub path: Option<String>,
    pub member: Option<String>,
}

impl MatchRule {
    /// Rule matching the `Event` signals of one stream
    pub fn events_on_stream(stream: &str) -> Self {
        let address = BusAddress::event_for_stream(stream);
        Self {
            interface: Some(address.interface),
            path: Some(address.path),
            member: Some(address.member),
        }
    }

    pub fn matches(&self, address: &BusAddress) -> bool {
        self.interface.as_deref().is_none_or(|v| v == address.interface)
            && self.path.as_deref().is_none_or(|v| v == address.path)
            && self.member.as_deref().is_none_or(|v| v == address.member)
    }
}

/// One signal on the bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub address: BusAddress,
    /// Event time, seconds since epoch
    pub timestamp: u64,
    /// Notification document
    pub payload: Arc<str>,
}

/// Outcome of polling a subscription
#[derive(Debug)]
pub enum BusPoll {
    /// A signal matching the subscription's rule
    Message(BusMessage),
    /// Nothing matched within the wait interval
    Empty,
    /// The bus was shut down
    Closed,
}

/// Process-wide pub/sub transport for live event delivery.
///
/// All signals travel over one broadcast channel; each subscription
/// filters by its match rule on receive, so subscribing and publishing
/// never block each other beyond the channel itself.
pub struct EventBus {
    tx: RwLock<Option<broadcast::Sender<BusMessage>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_QUEUE_DEPTH);
        Self {
            tx: RwLock::new(Some(tx)),
        }
    }

    /// Register interest in signals matching `rule`. Only signals published
    /// after this call are delivered.
    pub fn subscribe(&self, rule: MatchRule) -> Result<BusSubscription> {
        let guard = self.tx.read();
        let tx = guard
            .as_ref()
            .ok_or_else(|| NtfError::BusIo("event bus is closed".to_string()))?;
        debug!(?rule, "bus subscription added");
        Ok(BusSubscription {
            rx: tx.subscribe(),
            rule,
        })
    }

    /// Publish one signal. Having no subscribers is not an error; the
    /// signal is simply dropped.
    pub fn broadcast(&self, address: BusAddress, timestamp: u64, payload: Arc<str>) -> Result<usize> {
        let guard = self.tx.read();
        let tx = guard
            .as_ref()
            .ok_or_else(|| NtfError::BusIo("event bus is closed".to_string()))?;
        let message = BusMessage {
            address,
            timestamp,
            payload,
        };
        Ok(tx.send(message).unwrap_or(0))
    }

    /// Drop the sending side; active subscriptions observe end-of-stream
    /// once they drain their queues.
    pub fn close(&self) {
        *self.tx.write() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().is_none()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of one bus subscription
pub struct BusSubscription {
    rx: broadcast::Receiver<BusMessage>,
    rule: MatchRule,
}

impl BusSubscription {
    /// Wait up to `wait` for a signal matching this subscription's rule.
    /// Non-matching signals are consumed and discarded without resetting
    /// the deadline.
    pub async fn poll(&mut self, wait: Duration) -> BusPoll {
        let deadline = Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return BusPoll::Empty,
                Ok(Err(broadcast::error::RecvError::Closed)) => return BusPoll::Closed,
                Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                    warn!(missed, "subscriber lagged behind the event bus");
                }
                Ok(Ok(message)) => {
                    if self.rule.matches(&message.address) {
                        return BusPoll::Message(message);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("rule", &self.rule)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    fn payload(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_subscribe_then_receive() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(MatchRule::events_on_stream("NETCONF")).unwrap();

        bus.broadcast(BusAddress::event_for_stream("NETCONF"), 7, payload("<n/>"))
            .unwrap();

        match sub.poll(WAIT).await {
            BusPoll::Message(m) => {
                assert_eq!(m.timestamp, 7);
                assert_eq!(&*m.payload, "<n/>");
                assert_eq!(m.address.path, "/libnetconf/notifications/stream/NETCONF");
            }
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rule_filters_other_streams() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(MatchRule::events_on_stream("A")).unwrap();

        bus.broadcast(BusAddress::event_for_stream("B"), 1, payload("<b/>"))
            .unwrap();

        assert!(matches!(sub.poll(WAIT).await, BusPoll::Empty));
    }

    #[tokio::test]
    async fn test_fifo_per_publisher() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(MatchRule::events_on_stream("S")).unwrap();

        for i in 0..10u64 {
            bus.broadcast(BusAddress::event_for_stream("S"), i, payload("<e/>"))
                .unwrap();
        }
        for i in 0..10u64 {
            match sub.poll(WAIT).await {
                BusPoll::Message(m) => assert_eq!(m.timestamp, i),
                other => panic!("expected message {i}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_message_without_subscriber_is_lost() {
        let bus = EventBus::new();
        bus.broadcast(BusAddress::event_for_stream("S"), 1, payload("<lost/>"))
            .unwrap();

        let mut sub = bus.subscribe(MatchRule::events_on_stream("S")).unwrap();
        assert!(matches!(sub.poll(WAIT).await, BusPoll::Empty));
    }

    #[tokio::test]
    async fn test_close_ends_subscriptions() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(MatchRule::events_on_stream("S")).unwrap();

        bus.close();
        assert!(bus.is_closed());
        assert!(matches!(sub.poll(WAIT).await, BusPoll::Closed));
        assert!(bus
            .broadcast(BusAddress::event_for_stream("S"), 1, payload("<x/>"))
            .is_err());
        assert!(bus.subscribe(MatchRule::default()).is_err());
    }

    #[test]
    fn test_match_rule_wildcards() {
        let address = BusAddress::event_for_stream("S");
        assert!(MatchRule::default().matches(&address));

        let rule = MatchRule {
            interface: Some(BUS_INTERFACE.to_string()),
            path: None,
            member: Some("Event".to_string()),
        };
        assert!(rule.matches(&address));
        assert!(rule.matches(&BusAddress::event_for_stream("other")));

        let mut wrong = rule;
        wrong.member = Some("Removed".to_string());
        assert!(!wrong.matches(&address));
    }
}
