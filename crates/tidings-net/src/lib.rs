// Connection management for the Tidings sync engine: one persistent,
// authenticated session with heartbeat and backoff reconnection.

pub mod backoff;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod transport;
pub mod ws;

pub use backoff::ReconnectPolicy;
pub use connection::{ConnectionCommand, ConnectionConfig, ConnectionEvent, ConnectionManager};
pub use error::NetError;
pub use transport::{Connector, Credential, Inbound, Link};
pub use ws::WsConnector;
