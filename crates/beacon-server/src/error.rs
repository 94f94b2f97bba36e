use std::io;

/// Errors surfaced through the hub's public API.
///
/// Only bind failures escape `start`; decode, send, and connection faults are
/// contained inside the hub and observable through logs and `Delivery`
/// counts.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },
}
