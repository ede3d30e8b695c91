//! Dispatch loops bridging the iterator to a notification transport.
//!
//! The transport itself lives outside this crate; it plugs in through the
//! [`NotificationSink`] and [`NotificationSource`] traits. The same goes
//! for payload filtering, which arrives as a [`NotificationFilter`]
//! predicate.

use tracing::{debug, warn};

use crate::core::error::{NtfError, Result};
use crate::core::event::now_epoch;
use crate::core::iterator::{IterNext, POLL_INTERVAL};
use crate::manager::NotificationManager;
use crate::notif::{Notification, NotificationKind};
use crate::subscription::SubscriptionRequest;

/// Outbound side of a notification-capable session
#[allow(async_fn_in_trait)]
pub trait NotificationSink {
    /// Whether the session still accepts notifications
    fn is_active(&self) -> bool;
    /// Deliver one notification to the peer
    async fn send(&mut self, notification: &Notification) -> Result<()>;
}

/// Inbound side of a notification-capable session
#[allow(async_fn_in_trait)]
pub trait NotificationSource {
    /// Whether the session can still produce notifications
    fn is_active(&self) -> bool;
    /// Next received notification, or `None` when nothing is pending
    async fn recv(&mut self) -> Result<Option<Notification>>;
}

/// Payload predicate applied before delivery
pub trait NotificationFilter {
    fn matches(&self, notification_xml: &str) -> bool;
}

impl<F: Fn(&str) -> bool> NotificationFilter for F {
    fn matches(&self, notification_xml: &str) -> bool {
        self(notification_xml)
    }
}

fn is_marker(notification: &Notification) -> bool {
    matches!(
        notification.kind(),
        Some(NotificationKind::ReplayComplete) | Some(NotificationKind::NotificationComplete)
    )
}

/// Serve one subscription: validate the request, replay and follow the
/// stream, and push every notification in the window into `sink` until the
/// window closes or the sink goes inactive. Ends with a
/// `notificationComplete` marker. Returns the number of notifications
/// delivered.
pub async fn dispatch_send<S: NotificationSink>(
    manager: &NotificationManager,
    sink: &mut S,
    request: &SubscriptionRequest,
    filter: Option<&dyn NotificationFilter>,
) -> Result<u64> {
    let subscription = manager
        .subscription_check(request)
        .map_err(|e| NtfError::InvalidArgument(e.to_string()))?;

    let mut iter = manager.iter_start(&subscription.stream)?;
    let mut count = 0u64;

    debug!(
        stream = %subscription.stream,
        start = ?subscription.start_time,
        stop = ?subscription.stop_time,
        "subscription dispatch started"
    );

    loop {
        if !sink.is_active() {
            break;
        }
        match iter.next(subscription.start_time, subscription.stop_time).await {
            IterNext::Event(notification) => {
                if let Some(filter) = filter {
                    if !is_marker(&notification) && !filter.matches(notification.xml()) {
                        continue;
                    }
                }
                sink.send(&notification).await?;
                count += 1;
            }
            IterNext::Idle => continue,
            IterNext::End => break,
        }
    }

    if sink.is_active() {
        sink.send(&Notification::notification_complete(now_epoch()))
            .await?;
        count += 1;
    }

    debug!(stream = %subscription.stream, count, "subscription dispatch finished");
    Ok(count)
}

/// Drain notifications from `source`, handing `(event_time, content)` of
/// each well-formed one to `on_notification`, until the stream ends with
/// `notificationComplete` or the source goes inactive. Returns the number
/// of notifications processed.
pub async fn dispatch_receive<S: NotificationSource>(
    source: &mut S,
    mut on_notification: impl FnMut(u64, &str),
) -> Result<u64> {
    let mut count = 0u64;

    while source.is_active() {
        match source.recv().await? {
            Some(notification) => {
                let complete =
                    notification.kind() == Some(NotificationKind::NotificationComplete);
                match (notification.event_time(), notification.content()) {
                    (Some(event_time), Some(content)) => {
                        on_notification(event_time, &content);
                        count += 1;
                    }
                    _ => warn!("ignoring malformed notification"),
                }
                if complete {
                    break;
                }
            }
            None => tokio::time::sleep(POLL_INTERVAL).await,
        }
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamsConfig;
    use crate::core::event::{Event, envelope, format_datetime};
    use std::collections::VecDeque;

    struct VecSink {
        active: bool,
        sent: Vec<Notification>,
        /// go inactive once this many notifications arrived
        limit: Option<usize>,
    }

    impl VecSink {
        fn new() -> Self {
            Self {
                active: true,
                sent: Vec::new(),
                limit: None,
            }
        }

        fn kinds(&self) -> Vec<Option<NotificationKind>> {
            self.sent.iter().map(|n| n.kind()).collect()
        }
    }

    impl NotificationSink for VecSink {
        fn is_active(&self) -> bool {
            self.active
        }

        async fn send(&mut self, notification: &Notification) -> Result<()> {
            self.sent.push(notification.clone());
            if let Some(limit) = self.limit {
                if self.sent.len() >= limit {
                    self.active = false;
                }
            }
            Ok(())
        }
    }

    struct VecSource {
        pending: VecDeque<Notification>,
    }

    impl NotificationSource for VecSource {
        fn is_active(&self) -> bool {
            !self.pending.is_empty()
        }

        async fn recv(&mut self) -> Result<Option<Notification>> {
            Ok(self.pending.pop_front())
        }
    }

    fn manager(dir: &tempfile::TempDir) -> NotificationManager {
        let manager = NotificationManager::init(StreamsConfig::new(dir.path())).unwrap();
        manager.stream_new("T", "", true).unwrap();
        manager.stream_allow_events("T", "e").unwrap();
        manager
            .publish(Some(1000), &Event::Generic { content: "<e><n>1</n></e>".to_string() })
            .unwrap();
        manager
            .publish(Some(1100), &Event::Generic { content: "<e><n>2</n></e>".to_string() })
            .unwrap();
        manager
    }

    fn request() -> SubscriptionRequest {
        SubscriptionRequest {
            stream: Some("T".to_string()),
            start_time: Some(1),
            stop_time: Some(2000),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_dispatch_send_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let mut sink = VecSink::new();

        let count = dispatch_send(&manager, &mut sink, &request(), None)
            .await
            .unwrap();

        assert_eq!(count, 4);
        assert_eq!(
            sink.kinds(),
            vec![
                Some(NotificationKind::Generic),
                Some(NotificationKind::Generic),
                Some(NotificationKind::ReplayComplete),
                Some(NotificationKind::NotificationComplete),
            ]
        );
        assert_eq!(sink.sent[0].timestamp(), 1000);
        assert_eq!(sink.sent[1].timestamp(), 1100);
    }

    #[tokio::test]
    async fn test_dispatch_send_rejects_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let mut sink = VecSink::new();

        let bad = SubscriptionRequest {
            stream: Some("absent".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            dispatch_send(&manager, &mut sink, &bad, None).await,
            Err(NtfError::InvalidArgument(_))
        ));
        assert!(sink.sent.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_send_applies_filter_but_keeps_markers() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let mut sink = VecSink::new();

        let reject_all = |_: &str| false;
        let count = dispatch_send(&manager, &mut sink, &request(), Some(&reject_all))
            .await
            .unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            sink.kinds(),
            vec![
                Some(NotificationKind::ReplayComplete),
                Some(NotificationKind::NotificationComplete),
            ]
        );
    }

    #[tokio::test]
    async fn test_dispatch_send_stops_with_inactive_sink() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        let mut sink = VecSink::new();
        sink.limit = Some(1);

        let count = dispatch_send(&manager, &mut sink, &request(), None)
            .await
            .unwrap();

        // one event delivered, then the session went away; no completion
        // marker is forced onto a dead sink
        assert_eq!(count, 1);
        assert_eq!(sink.kinds(), vec![Some(NotificationKind::Generic)]);
    }

    #[tokio::test]
    async fn test_dispatch_receive_until_complete() {
        let mut source = VecSource {
            pending: VecDeque::from(vec![
                Notification::new(
                    10,
                    envelope(&format_datetime(10), "<e><n>1</n></e>"),
                ),
                Notification::notification_complete(20),
                Notification::new(
                    30,
                    envelope(&format_datetime(30), "<e><n>late</n></e>"),
                ),
            ]),
        };

        let mut received = Vec::new();
        let count = dispatch_receive(&mut source, |time, content| {
            received.push((time, content.to_string()));
        })
        .await
        .unwrap();

        // processing stops at notificationComplete; the late event stays
        assert_eq!(count, 2);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], (10, "<e><n>1</n></e>".to_string()));
        assert_eq!(received[1].1, "<notificationComplete/>");
        assert_eq!(source.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_receive_skips_malformed() {
        let mut source = VecSource {
            pending: VecDeque::from(vec![
                Notification::new(0, "<garbage".to_string()),
                Notification::notification_complete(20),
            ]),
        };

        let mut received = Vec::new();
        let count = dispatch_receive(&mut source, |time, content| {
            received.push((time, content.to_string()));
        })
        .await
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(received.len(), 1);
    }
}
