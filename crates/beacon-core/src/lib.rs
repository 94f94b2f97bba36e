pub mod codec;
pub mod events;

pub use codec::{decode, encode, DecodeError, InboundPayload};
pub use events::{Event, EventKind, DEFAULT_SOURCE};
