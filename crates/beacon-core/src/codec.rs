//! Wire codec for the hub's message format: one UTF-8 JSON object per
//! message, schema `{ kind, source, timestamp }`.

use serde::Deserialize;

use crate::events::{Event, EventKind};

/// Failure modes for inbound wire messages. Neither is fatal to the
/// connection: callers log and drop the message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown event kind: {0}")]
    UnknownKind(String),
}

/// A recognized inbound message. Everything except the kind tag is optional
/// on the wire; the hub applies the source default and re-stamps the
/// timestamp itself.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundPayload {
    pub kind: EventKind,
    pub source: Option<String>,
}

/// Raw shape of an inbound object before validation. Unknown extra fields
/// (including any client-supplied `timestamp`) are ignored by serde.
#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(alias = "type")]
    kind: Option<String>,
    source: Option<String>,
}

/// Serialize an event for the wire.
pub fn encode(event: &Event) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Parse and validate an inbound message.
///
/// Bad syntax or a missing kind tag is `Malformed`; valid JSON with a tag we
/// do not recognize is `UnknownKind`.
pub fn decode(text: &str) -> Result<InboundPayload, DecodeError> {
    let raw: RawPayload =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let tag = raw
        .kind
        .ok_or_else(|| DecodeError::Malformed("missing kind tag".into()))?;

    let kind = match tag.as_str() {
        "restart" => EventKind::Restart,
        _ => return Err(DecodeError::UnknownKind(tag)),
    };

    Ok(InboundPayload {
        kind,
        source: raw.source,
    })
}
