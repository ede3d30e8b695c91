use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::event::now_epoch;
use crate::core::registry::{DEFAULT_STREAM, StreamRegistry};
use crate::xml;
use crate::xml::escape_text;

const BASE_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Parameters of a `<create-subscription>` request, as parsed by the RPC
/// layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Requested stream; the default stream when absent
    pub stream: Option<String>,
    /// Replay start, seconds since epoch
    pub start_time: Option<u64>,
    /// Delivery stop, seconds since epoch
    pub stop_time: Option<u64>,
    /// Raw filter element, validated for well-formedness only
    pub filter: Option<String>,
}

/// A validated subscription ready for dispatch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub stream: String,
    pub start_time: Option<u64>,
    pub stop_time: Option<u64>,
    pub filter: Option<String>,
}

/// Structured rejection of a subscription request, identifying the
/// offending field. Returned to the caller, never logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("requested stream '{0}' does not exist")]
    InvalidValue(String),

    #[error("required element '{0}' is missing")]
    MissingElement(&'static str),

    #[error("element '{0}' carries an unacceptable value")]
    BadElement(&'static str),
}

impl SubscriptionError {
    /// Protocol error tag for this rejection
    pub fn error_tag(&self) -> &'static str {
        match self {
            SubscriptionError::InvalidValue(_) => "invalid-value",
            SubscriptionError::MissingElement(_) => "missing-element",
            SubscriptionError::BadElement(_) => "bad-element",
        }
    }

    /// Render the rejection as an `<rpc-error>` document
    pub fn to_xml(&self) -> String {
        let mut doc = format!(
            "<rpc-error xmlns=\"{BASE_NS}\"><error-type>protocol</error-type>\
             <error-tag>{}</error-tag><error-severity>error</error-severity>",
            self.error_tag()
        );
        match self {
            SubscriptionError::InvalidValue(stream) => {
                doc.push_str(&format!(
                    "<error-message>Requested stream '{}' does not exist.</error-message>",
                    escape_text(stream)
                ));
            }
            SubscriptionError::MissingElement(element)
            | SubscriptionError::BadElement(element) => {
                doc.push_str(&format!(
                    "<error-info><bad-element>{element}</bad-element></error-info>"
                ));
            }
        }
        doc.push_str("</rpc-error>");
        doc
    }
}

/// Check a subscription request against the registry and the time-window
/// rules.
pub(crate) fn validate(
    registry: &StreamRegistry,
    request: &SubscriptionRequest,
) -> Result<Subscription, SubscriptionError> {
    let stream = request
        .stream
        .clone()
        .unwrap_or_else(|| DEFAULT_STREAM.to_string());

    if !registry.exists(&stream) {
        return Err(SubscriptionError::InvalidValue(stream));
    }
    if request.stop_time.is_some() && request.start_time.is_none() {
        return Err(SubscriptionError::MissingElement("startTime"));
    }
    if let (Some(start), Some(stop)) = (request.start_time, request.stop_time) {
        if start > stop {
            return Err(SubscriptionError::BadElement("stopTime"));
        }
    }
    if let Some(start) = request.start_time {
        if start > now_epoch() {
            return Err(SubscriptionError::BadElement("startTime"));
        }
    }
    if let Some(filter) = &request.filter {
        if !xml::is_well_formed(filter) {
            return Err(SubscriptionError::BadElement("filter"));
        }
    }

    Ok(Subscription {
        stream,
        start_time: request.start_time,
        stop_time: request.stop_time,
        filter: request.filter.clone(),
    })
}
