//! Connection abstraction consumed by the coordinator.
//!
//! A driver plugs in by implementing [`Connection`] for its physical
//! connection type. The coordinator only ever needs the transactional
//! controls below; statement execution stays with the driver.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::transaction::IsolationLevel;

/// Error reported by a driver. Wrapped into
/// [`TransactionError`](crate::transaction::TransactionError) at the
/// coordinator boundary.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// Identity of a target database.
///
/// Cheap to clone; two handles with the same name address the same database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatabaseId(Arc<str>);

impl DatabaseId {
    /// Create a database identity from a name.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    /// The database name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatabaseId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for DatabaseId {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}

/// A physical database connection.
///
/// Implementations must not commit or roll back on their own while
/// auto-commit is disabled; the coordinator owns that boundary.
pub trait Connection: Send {
    /// Whether statements are committed individually.
    fn auto_commit(&self) -> DriverResult<bool>;

    /// Enable or disable auto-commit.
    fn set_auto_commit(&mut self, enabled: bool) -> DriverResult<()>;

    /// The isolation level currently in effect.
    fn isolation(&self) -> DriverResult<IsolationLevel>;

    /// Change the isolation level for subsequent work.
    fn set_isolation(&mut self, level: IsolationLevel) -> DriverResult<()>;

    /// Commit pending work.
    fn commit(&mut self) -> DriverResult<()>;

    /// Discard pending work.
    fn rollback(&mut self) -> DriverResult<()>;
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn auto_commit(&self) -> DriverResult<bool> {
        (**self).auto_commit()
    }

    fn set_auto_commit(&mut self, enabled: bool) -> DriverResult<()> {
        (**self).set_auto_commit(enabled)
    }

    fn isolation(&self) -> DriverResult<IsolationLevel> {
        (**self).isolation()
    }

    fn set_isolation(&mut self, level: IsolationLevel) -> DriverResult<()> {
        (**self).set_isolation(level)
    }

    fn commit(&mut self) -> DriverResult<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> DriverResult<()> {
        (**self).rollback()
    }
}
