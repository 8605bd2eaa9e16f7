//! txshare - implicitly shared, reference-counted database transactions
//!
//! Call sites on the same execution context that begin a transaction on the
//! same database share one physical transaction. Nested begins join it,
//! nested closes only count down, and the outermost close commits or rolls
//! back exactly once before the connection goes back to its source.
//!
//! # Example
//!
//! ```ignore
//! use txshare::db::{ConnectionPool, DatabaseId};
//! use txshare::transaction::{Coordinator, TxOptions};
//!
//! let coordinator = Coordinator::new(ConnectionPool::new(factory, 8));
//! let db = DatabaseId::new("orders");
//!
//! coordinator.in_transaction(&db, TxOptions::new(), |tx| {
//!     tx.with_connection(|conn| insert_order(conn))?
//! })?;
//! ```

pub mod db;
pub mod transaction;

#[cfg(test)]
mod testing;
