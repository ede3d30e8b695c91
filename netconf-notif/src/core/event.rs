use chrono::{DateTime, Local, SecondsFormat, TimeZone};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{NtfError, Result};
use crate::xml::escape_text;

/// Namespace of the notification envelope
pub const NOTIFICATIONS_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";

/// Identity of the session an event originates from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub username: String,
    pub session_id: String,
    pub source_host: String,
}

impl SessionInfo {
    fn to_xml(&self) -> String {
        format!(
            "<username>{}</username><session-id>{}</session-id><source-host>{}</source-host>",
            escape_text(&self.username),
            escape_text(&self.session_id),
            escape_text(&self.source_host)
        )
    }
}

/// Datastore a configuration change applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datastore {
    Startup,
    Running,
}

impl Datastore {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datastore::Startup => "startup",
            Datastore::Running => "running",
        }
    }
}

/// Source of a configuration or capability change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedBy {
    /// The server itself changed the data
    Server,
    /// A user session changed the data
    User(SessionInfo),
}

impl ChangedBy {
    fn to_xml(&self) -> String {
        match self {
            ChangedBy::Server => "<server/>".to_string(),
            ChangedBy::User(session) => session.to_xml(),
        }
    }
}

/// Why a session ended, per the base notifications data model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    Closed,
    Killed,
    Dropped,
    Timeout,
    BadHello,
    Other,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::Closed => "closed",
            TerminationReason::Killed => "killed",
            TerminationReason::Dropped => "dropped",
            TerminationReason::Timeout => "timeout",
            TerminationReason::BadHello => "bad-hello",
            TerminationReason::Other => "other",
        }
    }
}

/// A publishable event, one variant per event kind.
///
/// Non-generic variants synthesize their inner XML element; `Generic`
/// carries a pre-formed fragment (this is also the path for
/// `netconf-confirmed-commit`, which has no dedicated synthesizer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller-supplied XML fragment, the event element first
    Generic { content: String },
    /// `<netconf-config-change>`
    ConfigChange {
        datastore: Datastore,
        changed_by: ChangedBy,
    },
    /// `<netconf-capability-change>` with the capability diff
    CapabilityChange {
        old: Vec<String>,
        new: Vec<String>,
        changed_by: ChangedBy,
    },
    /// `<netconf-session-start>`
    SessionStart { session: SessionInfo },
    /// `<netconf-session-end>`
    SessionEnd {
        session: SessionInfo,
        reason: TerminationReason,
        killed_by: Option<String>,
    },
}

impl Event {
    /// Render the inner event element of the notification.
    pub fn to_xml(&self) -> Result<String> {
        match self {
            Event::Generic { content } => {
                if content.trim().is_empty() {
                    return Err(NtfError::InvalidArgument(
                        "generic event carries no content".to_string(),
                    ));
                }
                Ok(content.clone())
            }
            Event::ConfigChange {
                datastore,
                changed_by,
            } => Ok(format!(
                "<netconf-config-change><datastore>{}</datastore>{}</netconf-config-change>",
                datastore.as_str(),
                changed_by.to_xml()
            )),
            Event::CapabilityChange {
                old,
                new,
                changed_by,
            } => Ok(format!(
                "<netconf-capability-change>{}{}</netconf-capability-change>",
                changed_by.to_xml(),
                capability_changes(old, new)
            )),
            Event::SessionStart { session } => Ok(format!(
                "<netconf-session-start>{}</netconf-session-start>",
                session.to_xml()
            )),
            Event::SessionEnd {
                session,
                reason,
                killed_by,
            } => {
                let killed = match killed_by {
                    Some(sid) if *reason == TerminationReason::Killed => {
                        format!("<killed-by>{}</killed-by>", escape_text(sid))
                    }
                    _ => String::new(),
                };
                Ok(format!(
                    "<netconf-session-end>{}{}<termination-reason>{}</termination-reason></netconf-session-end>",
                    session.to_xml(),
                    killed,
                    reason.as_str()
                ))
            }
        }
    }
}

/// Capability URI without its `?`-introduced parameters
fn base_uri(capability: &str) -> &str {
    capability.split('?').next().unwrap_or(capability)
}

/// Diff two capability lists into `added-capability`, `modified-capability`
/// and `deleted-capability` elements. URIs pair up by their base URI; a
/// paired URI whose full form changed is modified. Output order follows the
/// input lists, new before old.
fn capability_changes(old: &[String], new: &[String]) -> String {
    let mut out = String::new();

    for cap in new {
        match old.iter().find(|o| base_uri(o) == base_uri(cap)) {
            Some(previous) if previous != cap => {
                out.push_str(&format!(
                    "<modified-capability>{}</modified-capability>",
                    escape_text(cap)
                ));
            }
            Some(_) => {}
            None => {
                out.push_str(&format!(
                    "<added-capability>{}</added-capability>",
                    escape_text(cap)
                ));
            }
        }
    }

    for cap in old {
        if !new.iter().any(|n| base_uri(n) == base_uri(cap)) {
            out.push_str(&format!(
                "<deleted-capability>{}</deleted-capability>",
                escape_text(cap)
            ));
        }
    }

    out
}

/// Wrap an event element in the notification envelope.
pub(crate) fn envelope(event_time: &str, content: &str) -> String {
    format!(
        "<notification xmlns=\"{NOTIFICATIONS_NS}\"><eventTime>{event_time}</eventTime>{content}</notification>"
    )
}

/// Current wall clock, seconds since epoch
pub(crate) fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// Render an epoch timestamp as RFC 3339 text in the local timezone.
pub fn format_datetime(secs: u64) -> String {
    let secs = secs.min(i64::MAX as u64) as i64;
    match Local.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.to_rfc3339_opts(SecondsFormat::Secs, false)
        }
        chrono::LocalResult::None => String::new(),
    }
}

/// Parse RFC 3339 text back into an epoch timestamp.
pub fn parse_datetime(text: &str) -> Option<u64> {
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.timestamp().max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> SessionInfo {
        SessionInfo {
            username: "admin".to_string(),
            session_id: "42".to_string(),
            source_host: "10.0.0.7".to_string(),
        }
    }

    #[test]
    fn test_config_change_by_server() {
        let event = Event::ConfigChange {
            datastore: Datastore::Running,
            changed_by: ChangedBy::Server,
        };
        assert_eq!(
            event.to_xml().unwrap(),
            "<netconf-config-change><datastore>running</datastore><server/></netconf-config-change>"
        );
    }

    #[test]
    fn test_config_change_by_user() {
        let event = Event::ConfigChange {
            datastore: Datastore::Startup,
            changed_by: ChangedBy::User(session()),
        };
        let xml = event.to_xml().unwrap();
        assert!(xml.starts_with("<netconf-config-change><datastore>startup</datastore>"));
        assert!(xml.contains("<username>admin</username>"));
        assert!(xml.contains("<session-id>42</session-id>"));
        assert!(xml.contains("<source-host>10.0.0.7</source-host>"));
    }

    #[test]
    fn test_session_start() {
        let event = Event::SessionStart { session: session() };
        assert_eq!(
            event.to_xml().unwrap(),
            "<netconf-session-start><username>admin</username><session-id>42</session-id>\
             <source-host>10.0.0.7</source-host></netconf-session-start>"
        );
    }

    #[test]
    fn test_session_end_killed() {
        let event = Event::SessionEnd {
            session: session(),
            reason: TerminationReason::Killed,
            killed_by: Some("7".to_string()),
        };
        let xml = event.to_xml().unwrap();
        assert!(xml.contains("<killed-by>7</killed-by>"));
        assert!(xml.ends_with(
            "<termination-reason>killed</termination-reason></netconf-session-end>"
        ));
    }

    #[test]
    fn test_session_end_killed_by_requires_killed_reason() {
        let event = Event::SessionEnd {
            session: session(),
            reason: TerminationReason::Closed,
            killed_by: Some("7".to_string()),
        };
        let xml = event.to_xml().unwrap();
        assert!(!xml.contains("killed-by"));
        assert!(xml.contains("<termination-reason>closed</termination-reason>"));
    }

    #[test]
    fn test_generic_requires_content() {
        let event = Event::Generic {
            content: "  ".to_string(),
        };
        assert!(matches!(
            event.to_xml(),
            Err(NtfError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_session_fields_are_escaped() {
        let event = Event::SessionStart {
            session: SessionInfo {
                username: "eve<script>".to_string(),
                session_id: "1".to_string(),
                source_host: "a&b".to_string(),
            },
        };
        let xml = event.to_xml().unwrap();
        assert!(xml.contains("eve&lt;script&gt;"));
        assert!(xml.contains("a&amp;b"));
    }

    #[test]
    fn test_capability_diff() {
        let old = vec![
            "urn:cap:one".to_string(),
            "urn:cap:two?module=a".to_string(),
            "urn:cap:gone".to_string(),
        ];
        let new = vec![
            "urn:cap:one".to_string(),
            "urn:cap:two?module=b".to_string(),
            "urn:cap:fresh".to_string(),
        ];

        let diff = capability_changes(&old, &new);
        assert_eq!(
            diff,
            "<modified-capability>urn:cap:two?module=b</modified-capability>\
             <added-capability>urn:cap:fresh</added-capability>\
             <deleted-capability>urn:cap:gone</deleted-capability>"
        );
    }

    #[test]
    fn test_capability_diff_unchanged_lists() {
        let caps = vec!["urn:cap:one".to_string(), "urn:cap:two".to_string()];
        assert_eq!(capability_changes(&caps, &caps), "");
    }

    #[test]
    fn test_capability_change_event_order() {
        let event = Event::CapabilityChange {
            old: vec![],
            new: vec!["urn:cap:x".to_string()],
            changed_by: ChangedBy::Server,
        };
        assert_eq!(
            event.to_xml().unwrap(),
            "<netconf-capability-change><server/>\
             <added-capability>urn:cap:x</added-capability></netconf-capability-change>"
        );
    }

    #[test]
    fn test_datetime_round_trip() {
        let secs = 1_700_000_000u64;
        let text = format_datetime(secs);
        assert_eq!(parse_datetime(&text), Some(secs));
    }

    #[test]
    fn test_parse_datetime_rejects_garbage() {
        assert_eq!(parse_datetime("not a date"), None);
        assert_eq!(parse_datetime(""), None);
    }

    #[test]
    fn test_envelope_shape() {
        let doc = envelope("2023-11-14T22:13:20+00:00", "<x/>");
        assert!(doc.starts_with(&format!("<notification xmlns=\"{NOTIFICATIONS_NS}\">")));
        assert!(doc.contains("<eventTime>2023-11-14T22:13:20+00:00</eventTime><x/>"));
        assert!(doc.ends_with("</notification>"));
    }
}
