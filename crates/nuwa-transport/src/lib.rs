//! nuwa transport - the network update source
//!
//! - [`RelayServer`]: serves a [`nuwa_storage::RemoteStore`] to TCP clients
//!   speaking the `nuwa-protocol` JSON lines, pushing `changed` frames to
//!   watchers
//! - [`TcpRemoteStore`]: the client side, usable as the remote store of a
//!   `PersistenceAdapter` (no transactions)

pub mod client;
pub mod error;
pub mod handler;
pub mod tcp;

pub use client::TcpRemoteStore;
pub use error::{TransportError, TransportResult};
pub use handler::ConnectionHandler;
pub use tcp::RelayServer;
