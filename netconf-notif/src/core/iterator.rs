use std::sync::Weak;
use std::time::Duration;
use tracing::{debug, warn};

use super::bus::{BusPoll, BusSubscription};
use super::event::now_epoch;
use super::stream::Stream;
use crate::manager::Shared;
use crate::notif::Notification;

/// How long one live poll waits before handing control back to the caller
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Outcome of one [`StreamIter::next`] call
#[derive(Debug)]
pub enum IterNext {
    /// The next notification in the window
    Event(Notification),
    /// Nothing arrived within the poll interval; call again. This is the
    /// caller's cancellation point.
    Idle,
    /// The iteration is over: the window closed, the subsystem shut down,
    /// or the stream data became unreadable.
    End,
}

/// Per-subscriber cursor bridging stored history and live delivery.
///
/// Replay drains the stream file from its first record, then a synthetic
/// `replayComplete` marker is emitted exactly once, then delivery switches
/// to the live bus and never returns to the file. When no start time is
/// requested the file and the marker are skipped entirely.
///
/// The bus subscription is taken at construction, before any replay read,
/// so events published during replay are queued rather than lost. An event
/// committed between the last file read and an earlier bus delivery may be
/// observed twice across the seam.
///
/// Dropping the iterator unsubscribes from the bus.
pub struct StreamIter {
    shared: Weak<Shared>,
    stream: Weak<Stream>,
    name: String,
    offset: u64,
    replay_done: bool,
    subscription: BusSubscription,
}

impl StreamIter {
    pub(crate) fn new(
        shared: Weak<Shared>,
        stream: Weak<Stream>,
        name: String,
        offset: u64,
        subscription: BusSubscription,
    ) -> Self {
        Self {
            shared,
            stream,
            name,
            offset,
            replay_done: false,
            subscription,
        }
    }

    pub fn stream_name(&self) -> &str {
        &self.name
    }

    /// Produce the next notification whose timestamp falls into
    /// `[start, stop]`, where either bound may be unset.
    pub async fn next(&mut self, start: Option<u64>, stop: Option<u64>) -> IterNext {
        let Some(shared) = self.shared.upgrade() else {
            return IterNext::End;
        };
        if let (Some(start), Some(stop)) = (start, stop) {
            if stop < start {
                return IterNext::End;
            }
        }
        if start.is_none() {
            // no history requested; live from the start, no marker
            self.replay_done = true;
        }

        loop {
            if shared.is_closed() {
                return IterNext::End;
            }

            if !self.replay_done {
                let Some(stream) = self.stream.upgrade() else {
                    return IterNext::End;
                };
                if stream.replay_enabled() {
                    match stream.read_record_at(self.offset) {
                        Ok(Some(record)) => {
                            self.offset = record.next_offset;
                            if start.is_some_and(|s| record.timestamp < s) {
                                continue;
                            }
                            if stop.is_some_and(|s| record.timestamp > s) {
                                continue;
                            }
                            return IterNext::Event(Notification::new(
                                record.timestamp,
                                record.xml,
                            ));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(stream = %self.name, error = %e, "replay stopped on unreadable record");
                            return IterNext::End;
                        }
                    }
                }
                // one-shot transition to live delivery
                self.replay_done = true;
                debug!(stream = %self.name, "replay complete");
                return IterNext::Event(Notification::replay_complete(now_epoch()));
            }

            if stop.is_some_and(|s| s < now_epoch()) {
                // window already over, no point in consulting the bus
                return IterNext::End;
            }

            match self.subscription.poll(POLL_INTERVAL).await {
                BusPoll::Message(message) => {
                    if start.is_some_and(|s| message.timestamp < s) {
                        continue;
                    }
                    if stop.is_some_and(|s| message.timestamp > s) {
                        continue;
                    }
                    return IterNext::Event(Notification::new(
                        message.timestamp,
                        message.payload.to_string(),
                    ));
                }
                BusPoll::Empty => return IterNext::Idle,
                BusPoll::Closed => return IterNext::End,
            }
        }
    }
}

impl std::fmt::Debug for StreamIter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamIter")
            .field("stream", &self.name)
            .field("offset", &self.offset)
            .field("replay_done", &self.replay_done)
            .finish()
    }
}
