pub mod error;
pub mod hub;
pub mod registry;
pub mod server;

pub use error::HubError;
pub use hub::{
    Hub, HubConfig, HubState, HubStatus, StartOutcome, StopOutcome, DEFAULT_PORT,
};
pub use registry::{ConnState, Connection, ConnectionId, ConnectionRegistry, Delivery, SendError};
