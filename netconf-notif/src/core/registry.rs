use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{NtfError, Result};
use super::event::format_datetime;
use super::stream::Stream;
use crate::config::StreamsConfig;
use crate::xml::escape_text;

/// Name of the default stream that always exists after initialization
pub const DEFAULT_STREAM: &str = "NETCONF";

/// Base notification types pre-allowed on the default stream (RFC 6470)
pub const BASE_EVENTS: [&str; 5] = [
    "netconf-config-change",
    "netconf-capability-change",
    "netconf-session-start",
    "netconf-session-end",
    "netconf-confirmed-commit",
];

/// Namespace of the stream status document
const STREAMS_NS: &str = "urn:ietf:params:xml:ns:netmod:notification";

/// Observable attributes of one stream
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub name: String,
    pub description: String,
    pub replay_enabled: bool,
    pub created_at: u64,
}

/// Set of loaded streams, keyed by name.
///
/// The registry exclusively owns the [`Stream`] entities; iterators and
/// other consumers look streams up by name and hold weak references at
/// most. Discovery walks the streams directory once at initialization and
/// lazily probes it again for names that appear later.
pub struct StreamRegistry {
    directory: PathBuf,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    /// Initialize the registry: make the directory usable, scan it for
    /// stream files, and bootstrap the default stream.
    pub(crate) fn open(config: &StreamsConfig) -> Result<Self> {
        config.ensure_directory()?;
        let registry = Self {
            directory: config.directory.clone(),
            streams: RwLock::new(HashMap::new()),
        };
        registry.scan()?;
        registry.ensure_base_stream()?;
        Ok(registry)
    }

    /// Walk the streams directory and load every parseable stream file.
    /// Files that are not stream logs are skipped; a directory that cannot
    /// be read at all is a configuration error.
    fn scan(&self) -> Result<()> {
        let entries = fs::read_dir(&self.directory).map_err(|e| {
            NtfError::Configuration(format!(
                "unable to read streams directory {}: {e}",
                self.directory.display()
            ))
        })?;

        let mut streams = self.streams.write();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable directory entry");
                    continue;
                }
            };
            let path = entry.path();
            let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }

            match Stream::load(&path) {
                Ok(stream) => {
                    let name = stream.name().to_string();
                    if streams.contains_key(&name) {
                        warn!(stream = %name, path = %path.display(), "duplicate stream file ignored");
                        continue;
                    }
                    debug!(stream = %name, path = %path.display(), "loaded stream");
                    streams.insert(name, Arc::new(stream));
                }
                Err(NtfError::Corrupt(reason)) => {
                    debug!(path = %path.display(), %reason, "skipping non-stream file");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unable to load stream file");
                }
            }
        }
        Ok(())
    }

    fn ensure_base_stream(&self) -> Result<()> {
        if self.exists(DEFAULT_STREAM) {
            return Ok(());
        }
        let stream = self.create(DEFAULT_STREAM, "NETCONF Base Notifications", true)?;
        for event in BASE_EVENTS {
            stream.allow_event(event)?;
        }
        info!(stream = DEFAULT_STREAM, "created default stream");
        Ok(())
    }

    /// Create a new stream. Fails when a stream of that name is already
    /// registered.
    pub fn create(&self, name: &str, description: &str, replay: bool) -> Result<Arc<Stream>> {
        let mut streams = self.streams.write();
        if streams.contains_key(name) {
            return Err(NtfError::AlreadyExists(name.to_string()));
        }
        let stream = Arc::new(Stream::create(&self.directory, name, description, replay)?);
        streams.insert(name.to_string(), stream.clone());
        info!(stream = name, replay, "stream created");
        Ok(stream)
    }

    /// Look a stream up by name. Unknown names probe the directory once, so
    /// stream files created by a cooperating process after initialization
    /// are still found.
    pub fn get(&self, name: &str) -> Option<Arc<Stream>> {
        if let Some(stream) = self.streams.read().get(name) {
            return Some(stream.clone());
        }

        let path = self.directory.join(format!("{name}.events"));
        if !path.is_file() {
            return None;
        }
        match Stream::load(&path) {
            Ok(stream) if stream.name() == name => {
                let stream = Arc::new(stream);
                let mut streams = self.streams.write();
                Some(
                    streams
                        .entry(name.to_string())
                        .or_insert_with(|| {
                            debug!(stream = name, "picked up stream file created externally");
                            stream
                        })
                        .clone(),
                )
            }
            Ok(stream) => {
                warn!(
                    path = %path.display(),
                    header_name = stream.name(),
                    "stream file name does not match its header"
                );
                None
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "probe for stream file failed");
                None
            }
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Names of all registered streams, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.streams.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Observable attributes of all registered streams, sorted by name
    pub fn info(&self) -> Vec<StreamInfo> {
        let streams = self.streams.read();
        let mut infos: Vec<StreamInfo> = streams
            .values()
            .map(|s| StreamInfo {
                name: s.name().to_string(),
                description: s.description().to_string(),
                replay_enabled: s.replay_enabled(),
                created_at: s.created_at(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Whether `event` is admitted on `stream`; false for unknown streams
    pub fn event_allowed(&self, stream: &str, event: &str) -> bool {
        self.get(stream).is_some_and(|s| s.event_allowed(event))
    }

    /// Add `event` to the allow-list of `stream`
    pub fn allow_event(&self, stream: &str, event: &str) -> Result<()> {
        self.get(stream)
            .ok_or_else(|| NtfError::NotFound(stream.to_string()))?
            .allow_event(event)
    }

    /// Run `f` with the registry lock held over the live stream map
    pub(crate) fn with_streams<R>(&self, f: impl FnOnce(&HashMap<String, Arc<Stream>>) -> R) -> R {
        f(&self.streams.read())
    }

    /// Status document describing the available streams
    pub fn status_xml(&self) -> String {
        let mut doc = format!("<netconf xmlns=\"{STREAMS_NS}\"><streams>");
        for info in self.info() {
            doc.push_str(&format!(
                "<stream><name>{}</name><description>{}</description><replaySupport>{}</replaySupport>",
                escape_text(&info.name),
                escape_text(&info.description),
                info.replay_enabled
            ));
            if info.replay_enabled {
                doc.push_str(&format!(
                    "<replayLogCreationTime>{}</replayLogCreationTime>",
                    format_datetime(info.created_at)
                ));
            }
            doc.push_str("</stream>");
        }
        doc.push_str("</streams></netconf>");
        doc
    }

    /// Drop every loaded stream, closing files and unmapping rule regions
    pub(crate) fn close(&self) {
        self.streams.write().clear();
    }
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("directory", &self.directory)
            .field("streams", &self.list())
            .finish()
    }
}
