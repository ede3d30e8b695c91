use quick_xml::events::Event as XmlEvent;
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::core::event::{envelope, format_datetime, parse_datetime};

/// Kind of a received notification, derived from the first element after
/// `eventTime`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// Replay of stored events finished; live delivery follows
    ReplayComplete,
    /// The notification stream ended
    NotificationComplete,
    ConfigChange,
    CapabilityChange,
    SessionStart,
    SessionEnd,
    ConfirmedCommit,
    /// Any other event element
    Generic,
}

fn kind_for_element(name: &str) -> NotificationKind {
    match name {
        "replayComplete" => NotificationKind::ReplayComplete,
        "notificationComplete" => NotificationKind::NotificationComplete,
        "netconf-config-change" => NotificationKind::ConfigChange,
        "netconf-capability-change" => NotificationKind::CapabilityChange,
        "netconf-session-start" => NotificationKind::SessionStart,
        "netconf-session-end" => NotificationKind::SessionEnd,
        "netconf-confirmed-commit" => NotificationKind::ConfirmedCommit,
        _ => NotificationKind::Generic,
    }
}

/// One notification document together with its event timestamp.
///
/// The document is the full `<notification>` envelope as stored on disk
/// and carried on the bus; the accessors pull the interesting parts back
/// out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    timestamp: u64,
    xml: String,
}

impl Notification {
    pub(crate) fn new(timestamp: u64, xml: String) -> Self {
        Self { timestamp, xml }
    }

    /// Synthesized marker separating replay from live delivery
    pub fn replay_complete(timestamp: u64) -> Self {
        Self::new(
            timestamp,
            envelope(&format_datetime(timestamp), "<replayComplete/>"),
        )
    }

    /// Synthesized marker ending a notification stream
    pub fn notification_complete(timestamp: u64) -> Self {
        Self::new(
            timestamp,
            envelope(&format_datetime(timestamp), "<notificationComplete/>"),
        )
    }

    /// Event time as carried next to the record, seconds since epoch
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// The notification document
    pub fn xml(&self) -> &str {
        &self.xml
    }

    pub fn into_xml(self) -> String {
        self.xml
    }

    /// Kind of this notification. `None` when the document is not a
    /// notification or has no event element.
    pub fn kind(&self) -> Option<NotificationKind> {
        let mut reader = Reader::from_str(&self.xml);
        let mut inside = false;
        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(e)) | Ok(XmlEvent::Empty(e)) => {
                    let name = String::from_utf8(e.local_name().as_ref().to_vec()).ok()?;
                    if !inside {
                        if name != "notification" {
                            return None;
                        }
                        inside = true;
                        continue;
                    }
                    if name == "eventTime" {
                        reader.read_to_end(e.name()).ok()?;
                        continue;
                    }
                    return Some(kind_for_element(&name));
                }
                Ok(XmlEvent::End(_)) | Ok(XmlEvent::Eof) => return None,
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    /// Parse the `<eventTime>` element back into an epoch timestamp
    pub fn event_time(&self) -> Option<u64> {
        let mut reader = Reader::from_str(&self.xml);
        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(e)) => {
                    if e.local_name().as_ref() == b"eventTime" {
                        let text = reader.read_text(e.name()).ok()?;
                        return parse_datetime(&text);
                    }
                }
                Ok(XmlEvent::Eof) => return None,
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    }

    /// The event content: every child of `<notification>` except
    /// `eventTime`, serialized as it appeared in the document.
    pub fn content(&self) -> Option<String> {
        let mut reader = Reader::from_str(&self.xml);
        let mut writer = Writer::new(Vec::new());
        let mut depth = 0usize;
        loop {
            match reader.read_event() {
                Ok(XmlEvent::Start(e)) if depth == 0 => {
                    if e.local_name().as_ref() != b"notification" {
                        return None;
                    }
                    depth = 1;
                }
                Ok(XmlEvent::Start(e)) if depth == 1 && e.local_name().as_ref() == b"eventTime" => {
                    reader.read_to_end(e.name()).ok()?;
                }
                Ok(XmlEvent::Empty(e)) if depth == 1 && e.local_name().as_ref() == b"eventTime" => {}
                Ok(XmlEvent::Start(e)) => {
                    writer.write_event(XmlEvent::Start(e)).ok()?;
                    depth += 1;
                }
                Ok(XmlEvent::End(e)) => {
                    if depth == 1 {
                        break;
                    }
                    writer.write_event(XmlEvent::End(e)).ok()?;
                    depth -= 1;
                }
                Ok(XmlEvent::Eof) => return None,
                Ok(event) => {
                    if depth >= 1 {
                        writer.write_event(event).ok()?;
                    }
                }
                Err(_) => return None,
            }
        }
        String::from_utf8(writer.into_inner()).ok()
    }
}
