//! Connection pooling for database access.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::debug;

use super::connection::{Connection, DatabaseId, DriverResult};
use super::source::ConnectionSource;

/// Opens new physical connections on behalf of a [`ConnectionPool`].
pub trait ConnectionFactory: Send + Sync {
    /// Connection type produced by this factory.
    type Connection: Connection;

    /// Open a new connection to `db`.
    fn connect(&self, db: &DatabaseId) -> DriverResult<Self::Connection>;
}

/// Pool-level failures, surfaced to the coordinator as driver errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every connection for the database is checked out.
    #[error("connection pool exhausted for {db} (max {max})")]
    Exhausted { db: DatabaseId, max: usize },
}

struct Slot<C> {
    idle: VecDeque<C>,
    created: usize,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            idle: VecDeque::new(),
            created: 0,
        }
    }
}

/// Bounded connection pool, one slot per target database.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    max_connections: usize,
    slots: Mutex<HashMap<DatabaseId, Slot<F::Connection>>>,
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Create a new connection pool.
    pub fn new(factory: F, max_connections: usize) -> Self {
        Self {
            factory,
            max_connections,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Get the number of idle connections for `db`.
    pub fn available(&self, db: &DatabaseId) -> usize {
        self.slots.lock().get(db).map_or(0, |slot| slot.idle.len())
    }

    /// Get the total number of connections created for `db`.
    pub fn created(&self, db: &DatabaseId) -> usize {
        self.slots.lock().get(db).map_or(0, |slot| slot.created)
    }

    /// Maximum number of connections per database.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

impl<F: ConnectionFactory> ConnectionSource for ConnectionPool<F> {
    type Connection = F::Connection;

    fn acquire(&self, db: &DatabaseId) -> DriverResult<Self::Connection> {
        // Try to get an available connection.
        {
            let mut slots = self.slots.lock();
            let slot = slots.entry(db.clone()).or_default();
            if let Some(conn) = slot.idle.pop_front() {
                return Ok(conn);
            }
            if slot.created >= self.max_connections {
                return Err(Box::new(PoolError::Exhausted {
                    db: db.clone(),
                    max: self.max_connections,
                }));
            }
            // Reserve the slot before connecting so concurrent callers
            // cannot overshoot the limit.
            slot.created += 1;
        }

        match self.factory.connect(db) {
            Ok(conn) => {
                debug!(db = %db, "opened pooled connection");
                Ok(conn)
            }
            Err(e) => {
                if let Some(slot) = self.slots.lock().get_mut(db) {
                    slot.created -= 1;
                }
                Err(e)
            }
        }
    }

    fn release(&self, conn: Self::Connection, db: &DatabaseId) -> DriverResult<()> {
        let mut slots = self.slots.lock();
        slots.entry(db.clone()).or_default().idle.push_back(conn);
        Ok(())
    }
}
