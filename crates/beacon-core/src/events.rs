use serde::{Deserialize, Serialize};

/// Source tag used when an inbound payload does not carry one.
pub const DEFAULT_SOURCE: &str = "peer";

/// Kinds of events the hub recognizes. Only `restart` is defined today;
/// the wire tag is forward-extensible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Restart,
}

/// A normalized event as broadcast to every connected peer.
///
/// `timestamp` is milliseconds since epoch, assigned by the hub at broadcast
/// time. Inbound timestamps are never trusted. The wire tag serializes as
/// `kind` but is also accepted under the legacy `type` name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(alias = "type")]
    pub kind: EventKind,
    pub source: String,
    pub timestamp: i64,
}

impl Event {
    pub fn restart(source: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: EventKind::Restart,
            source: source.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_constructor_sets_kind() {
        let event = Event::restart("editor", 1_700_000_000_000);
        assert_eq!(event.kind, EventKind::Restart);
        assert_eq!(event.source, "editor");
    }
}
