use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::config::StreamsConfig;
use crate::core::bus::{BusAddress, EventBus, MatchRule};
use crate::core::error::{NtfError, Result};
use crate::core::event::{Event, envelope, format_datetime, now_epoch};
use crate::core::iterator::StreamIter;
use crate::core::registry::{StreamInfo, StreamRegistry};
use crate::subscription::{Subscription, SubscriptionError, SubscriptionRequest, validate};
use crate::xml;

/// Result of a successful publish
#[derive(Debug, Clone, Serialize)]
pub struct PublishResult {
    /// Name of the event element routed on
    pub event: String,
    /// Timestamp stored and announced with the record
    pub timestamp: u64,
    /// Streams whose file accepted the record
    pub streams_stored: usize,
    /// Streams the record was announced for on the live bus
    pub streams_signaled: usize,
}

pub(crate) struct Shared {
    pub(crate) streams: StreamRegistry,
    pub(crate) bus: EventBus,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Entry point of the notification subsystem.
///
/// Owns the stream registry and the live bus and threads them through the
/// public operations. Cheap to clone; all clones share the same state.
/// [`NotificationManager::close`] shuts the subsystem down for every clone
/// and ends all open iterators.
#[derive(Clone)]
pub struct NotificationManager {
    shared: Arc<Shared>,
}

impl NotificationManager {
    /// Bring the subsystem up: resolve and scan the streams directory and
    /// make sure the default stream exists.
    pub fn init(config: StreamsConfig) -> Result<Self> {
        let streams = StreamRegistry::open(&config)?;
        info!(
            directory = %config.directory.display(),
            streams = streams.list().len(),
            "notification subsystem initialized"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                streams,
                bus: EventBus::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.is_closed() {
            return Err(NtfError::Configuration(
                "notification subsystem is closed".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a new stream
    pub fn stream_new(&self, name: &str, description: &str, replay: bool) -> Result<()> {
        self.ensure_open()?;
        self.shared.streams.create(name, description, replay)?;
        Ok(())
    }

    /// Add `event` to the allow-list of `stream`
    pub fn stream_allow_events(&self, stream: &str, event: &str) -> Result<()> {
        self.ensure_open()?;
        self.shared.streams.allow_event(stream, event)
    }

    /// Names of all known streams, sorted
    pub fn stream_list(&self) -> Vec<String> {
        self.shared.streams.list()
    }

    pub fn stream_exists(&self, name: &str) -> bool {
        self.shared.streams.exists(name)
    }

    /// Observable attributes of all known streams
    pub fn stream_info(&self) -> Vec<StreamInfo> {
        self.shared.streams.info()
    }

    /// Whether `event` is admitted on `stream`
    pub fn event_allowed(&self, stream: &str, event: &str) -> bool {
        self.shared.streams.event_allowed(stream, event)
    }

    /// Status document describing the available streams
    pub fn status_xml(&self) -> String {
        self.shared.streams.status_xml()
    }

    /// Store and announce one event.
    ///
    /// The record lands in the file of every replay-enabled stream whose
    /// allow-list admits the event element, then the same record is
    /// announced on the live bus for every admitting stream, replay or
    /// not. Storage failures on one stream do not stop the fan-out; they
    /// surface as an error once the remaining streams were served. A
    /// failure to announce an already stored record only logs a warning.
    pub fn publish(&self, event_time: Option<u64>, event: &Event) -> Result<PublishResult> {
        self.ensure_open()?;

        let timestamp = event_time.unwrap_or_else(now_epoch);
        let content = event.to_xml()?;
        let name = xml::first_element_name(&content).ok_or_else(|| {
            NtfError::InvalidArgument("event content has no root element".to_string())
        })?;
        let record = envelope(&format_datetime(timestamp), &content);
        let payload: Arc<str> = Arc::from(record);

        let mut stored = 0usize;
        let mut failed: Vec<String> = Vec::new();
        let mut targets: Vec<String> = Vec::new();

        self.shared.streams.with_streams(|streams| {
            for stream in streams.values() {
                if !stream.event_allowed(&name) {
                    continue;
                }
                targets.push(stream.name().to_string());
                if !stream.replay_enabled() {
                    continue;
                }
                match stream.append_record(&payload, timestamp) {
                    Ok(()) => stored += 1,
                    Err(e) => {
                        warn!(stream = stream.name(), error = %e, "storing event failed");
                        failed.push(stream.name().to_string());
                    }
                }
            }
        });

        // announce on the bus only after the registry lock is gone
        let mut signaled = 0usize;
        for stream in &targets {
            match self
                .shared
                .bus
                .broadcast(BusAddress::event_for_stream(stream), timestamp, payload.clone())
            {
                Ok(_) => signaled += 1,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "event stored but live announcement failed");
                }
            }
        }

        if !failed.is_empty() {
            return Err(NtfError::StorageIo(format!(
                "event '{name}' could not be stored on stream(s) {}",
                failed.join(", ")
            )));
        }

        debug!(event = %name, timestamp, stored, signaled, "event published");
        Ok(PublishResult {
            event: name,
            timestamp,
            streams_stored: stored,
            streams_signaled: signaled,
        })
    }

    /// Open a replay-then-live iterator over `stream`.
    ///
    /// The bus subscription is established here, before any replay read,
    /// so events published while history is drained are not lost.
    pub fn iter_start(&self, stream: &str) -> Result<StreamIter> {
        self.ensure_open()?;
        let entity = self
            .shared
            .streams
            .get(stream)
            .ok_or_else(|| NtfError::NotFound(stream.to_string()))?;
        let subscription = self.shared.bus.subscribe(MatchRule::events_on_stream(stream))?;
        Ok(StreamIter::new(
            Arc::downgrade(&self.shared),
            Arc::downgrade(&entity),
            stream.to_string(),
            entity.data_offset(),
            subscription,
        ))
    }

    /// Validate a subscription request, resolving the default stream
    pub fn subscription_check(
        &self,
        request: &SubscriptionRequest,
    ) -> std::result::Result<Subscription, SubscriptionError> {
        validate(&self.shared.streams, request)
    }

    /// Shut the subsystem down: end live delivery, then drop every loaded
    /// stream so files close and rule regions unmap. Open iterators return
    /// end-of-stream on their next call.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.bus.close();
        self.shared.streams.close();
        info!("notification subsystem closed");
    }
}

impl std::fmt::Debug for NotificationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationManager")
            .field("streams", &self.stream_list())
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
