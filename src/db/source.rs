//! Where connections come from.

use super::connection::{Connection, DatabaseId, DriverResult};
use crate::transaction::ContextId;

/// Hands out physical connections for a target database.
///
/// The coordinator releases every connection it acquired exactly once.
pub trait ConnectionSource: Send + Sync {
    /// Connection type produced by this source.
    type Connection: Connection;

    /// Acquire a connection for `db`.
    fn acquire(&self, db: &DatabaseId) -> DriverResult<Self::Connection>;

    /// Return a connection previously acquired for `db`.
    fn release(&self, conn: Self::Connection, db: &DatabaseId) -> DriverResult<()>;
}

/// Bridge to a transaction manager that lives outside this crate.
///
/// When a bridge reports a connection already bound to the calling context,
/// the coordinator borrows it instead of acquiring its own. A borrowed
/// connection is never committed by the coordinator unless it was in
/// auto-commit mode, and is handed back through [`give_back`] rather than
/// released to the source.
///
/// [`give_back`]: ExternalTransactionBridge::give_back
pub trait ExternalTransactionBridge<C>: Send + Sync {
    /// The connection bound to `context` for `db`, if the external manager
    /// has one open.
    fn bound_connection(&self, db: &DatabaseId, context: ContextId) -> Option<C>;

    /// Hand a borrowed connection back once the shared transaction closes.
    fn give_back(&self, conn: C, db: &DatabaseId) {
        let _ = (conn, db);
    }
}
