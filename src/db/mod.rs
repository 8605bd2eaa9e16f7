//! Collaborator boundary: connections, their sources, and pooling.
//!
//! The coordinator never constructs connections itself. It asks a
//! [`ConnectionSource`] for one, optionally after checking an
//! [`ExternalTransactionBridge`] for a connection some other manager
//! already has open.

mod connection;
mod pool;
mod source;

pub use connection::{Connection, DatabaseId, DriverError, DriverResult};
pub use pool::{ConnectionFactory, ConnectionPool, PoolError};
pub use source::{ConnectionSource, ExternalTransactionBridge};
