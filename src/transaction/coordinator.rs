//! Coordinator - the entry point application code talks to.
//!
//! The Coordinator hands out shared transactions keyed by
//! (database, execution context, coordinator). It handles:
//! - Joining an already-open transaction on nested `begin`
//! - Acquiring, configuring and releasing the physical connection
//! - Running work outside the current transaction
//! - Routing connection access to the shared transaction when one is open

use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::{ConnectionSource, DatabaseId, ExternalTransactionBridge};
use crate::transaction::config::{Access, CoordinatorConfig, TxOptions};
use crate::transaction::detach::DetachGuard;
use crate::transaction::error::{Operation, TransactionError, TransactionResult};
use crate::transaction::handle::{lend, TransactionHandle, TransactionInfo};
use crate::transaction::identity::{ContextId, CreatorTag, TxIdentity};
use crate::transaction::registry::{Registry, TxEntry};
use crate::transaction::state::{ConnectionSink, TransactionState};

pub(crate) struct CoordinatorInner<S: ConnectionSource> {
    source: S,
    bridge: Option<Box<dyn ExternalTransactionBridge<S::Connection>>>,
    pub(crate) registry: Registry<S::Connection>,
    creator: CreatorTag,
    pub(crate) config: CoordinatorConfig,
}

impl<S: ConnectionSource> ConnectionSink<S::Connection> for CoordinatorInner<S> {
    fn dispose(&self, conn: S::Connection, db: &DatabaseId, close: bool) {
        if close {
            if let Err(e) = self.source.release(conn, db) {
                warn!(db = %db, error = %e, "failed to release connection");
            }
        } else if let Some(bridge) = &self.bridge {
            bridge.give_back(conn, db);
        }
    }
}

/// Transaction coordinator - shares one physical transaction among every
/// participant on the same execution context and database.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
/// Transactions themselves never cross contexts.
pub struct Coordinator<S: ConnectionSource> {
    inner: Arc<CoordinatorInner<S>>,
}

impl<S: ConnectionSource> Clone for Coordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: ConnectionSource> Coordinator<S> {
    /// Create a coordinator with the default configuration.
    pub fn new(source: S) -> Self {
        Self::with_config(source, CoordinatorConfig::default())
    }

    pub fn with_config(source: S, config: CoordinatorConfig) -> Self {
        Self::build(source, config, None)
    }

    /// Create a coordinator that consults `bridge` for connections already
    /// bound by an external transaction manager.
    pub fn with_bridge<B>(source: S, config: CoordinatorConfig, bridge: B) -> Self
    where
        B: ExternalTransactionBridge<S::Connection> + 'static,
    {
        Self::build(source, config, Some(Box::new(bridge)))
    }

    fn build(
        source: S,
        config: CoordinatorConfig,
        bridge: Option<Box<dyn ExternalTransactionBridge<S::Connection>>>,
    ) -> Self {
        let creator = CreatorTag::new(&config.name);
        Self {
            inner: Arc::new(CoordinatorInner {
                source,
                bridge,
                registry: Registry::new(),
                creator,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Get a reference to the underlying connection source.
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    pub fn creator(&self) -> &CreatorTag {
        &self.inner.creator
    }

    /// Operations bound to an explicit execution context.
    pub fn scope(&self, context: ContextId) -> Scope<'_, S> {
        Scope {
            coordinator: self,
            context,
        }
    }

    /// Operations bound to the calling thread's context.
    pub fn current(&self) -> Scope<'_, S> {
        self.scope(ContextId::current())
    }

    /// Begin (or join) the shared transaction for `db`.
    pub fn begin(&self, db: &DatabaseId) -> TransactionResult<TransactionHandle<S>> {
        self.current().begin(db)
    }

    /// Begin (or join) the shared transaction for `db` with explicit options.
    pub fn begin_with(&self, db: &DatabaseId, opts: TxOptions) -> TransactionResult<TransactionHandle<S>> {
        self.current().begin_with(db, opts)
    }

    /// Check if a shared transaction is open for `db` on this thread.
    pub fn is_active_for(&self, db: &DatabaseId) -> bool {
        self.current().is_active_for(db)
    }

    /// Run `action` with the current transaction for `db` hidden, so that
    /// anything it begins gets its own transaction.
    pub fn run_outside_current_transaction(
        &self,
        db: &DatabaseId,
        action: impl FnOnce(),
    ) -> TransactionResult<()> {
        self.current().run_outside_current_transaction(db, action)
    }

    /// Like [`run_outside_current_transaction`](Self::run_outside_current_transaction),
    /// returning the action's result.
    pub fn call_outside_current_transaction<R>(
        &self,
        db: &DatabaseId,
        action: impl FnOnce() -> R,
    ) -> TransactionResult<R> {
        self.current().call_outside_current_transaction(db, action)
    }

    /// Run `f` on the connection this thread should use for `db`.
    pub fn with_connection<R>(
        &self,
        db: &DatabaseId,
        access: Access,
        f: impl FnOnce(&mut S::Connection) -> R,
    ) -> TransactionResult<R> {
        self.current().with_connection(db, access, f)
    }

    /// Execute a function within a transaction, automatically committing or rolling back.
    pub fn in_transaction<T, E, F>(&self, db: &DatabaseId, opts: TxOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(&TransactionHandle<S>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        self.current().in_transaction(db, opts, f)
    }

    /// Get the number of open shared transactions, across all contexts.
    pub fn active_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Snapshots of every open shared transaction.
    pub fn active_transactions(&self) -> Vec<TransactionInfo> {
        self.inner
            .registry
            .entries()
            .iter()
            .map(|entry| TransactionInfo::from_state(&entry.state.lock()))
            .collect()
    }
}

impl<S: ConnectionSource> std::fmt::Debug for Coordinator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("creator", &self.inner.creator)
            .field("active_count", &self.active_count())
            .finish()
    }
}

/// Coordinator operations bound to one execution context.
pub struct Scope<'a, S: ConnectionSource> {
    coordinator: &'a Coordinator<S>,
    context: ContextId,
}

impl<S: ConnectionSource> Scope<'_, S> {
    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Registry key for `db` in this context.
    pub fn identity(&self, db: &DatabaseId) -> TxIdentity {
        TxIdentity::new(db.clone(), self.context, self.coordinator.inner.creator.clone())
    }

    pub fn begin(&self, db: &DatabaseId) -> TransactionResult<TransactionHandle<S>> {
        self.begin_with(db, TxOptions::default())
    }

    pub fn begin_with(&self, db: &DatabaseId, opts: TxOptions) -> TransactionResult<TransactionHandle<S>> {
        let inner = &self.coordinator.inner;
        let identity = self.identity(db);

        if let Some(entry) = inner.registry.lookup(&identity) {
            entry.state.lock().increment(opts.isolation, opts.for_update_only)?;
            return Ok(TransactionHandle::new(inner.clone(), entry));
        }

        let (conn, close_connection) = match self.bound_connection(db) {
            Some(conn) => (conn, false),
            None => {
                let conn = inner
                    .source
                    .acquire(db)
                    .map_err(|e| TransactionError::resource(&identity, Operation::Acquire, e))?;
                (conn, true)
            }
        };

        let mut state = match TransactionState::open(identity.clone(), conn, close_connection) {
            Ok(state) => state,
            Err((err, conn)) => {
                inner.dispose(conn, db, close_connection);
                return Err(err);
            }
        };
        let isolation = opts.isolation.or(inner.config.default_isolation);
        if let Err(err) = state.increment(isolation, opts.for_update_only) {
            state.discard(&**inner);
            return Err(err);
        }

        let entry = Arc::new(TxEntry::new(identity, state));
        inner.registry.put(entry.clone());
        Ok(TransactionHandle::new(inner.clone(), entry))
    }

    fn bound_connection(&self, db: &DatabaseId) -> Option<S::Connection> {
        let inner = &self.coordinator.inner;
        if !inner.config.use_external_transactions {
            return None;
        }
        let conn = inner.bridge.as_ref()?.bound_connection(db, self.context)?;
        debug!(db = %db, context = %self.context, "joining externally managed transaction");
        Some(conn)
    }

    pub fn is_active_for(&self, db: &DatabaseId) -> bool {
        self.coordinator
            .inner
            .registry
            .lookup(&self.identity(db))
            .is_some()
    }

    pub fn run_outside_current_transaction(
        &self,
        db: &DatabaseId,
        action: impl FnOnce(),
    ) -> TransactionResult<()> {
        self.call_outside_current_transaction(db, action)
    }

    pub fn call_outside_current_transaction<R>(
        &self,
        db: &DatabaseId,
        action: impl FnOnce() -> R,
    ) -> TransactionResult<R> {
        let registry = &self.coordinator.inner.registry;
        let Some(entry) = registry.lookup(&self.identity(db)) else {
            return Ok(action());
        };

        let guard = DetachGuard::detach(registry, &entry);
        let out = action();
        guard.reattach()?;
        Ok(out)
    }

    pub fn with_connection<R>(
        &self,
        db: &DatabaseId,
        access: Access,
        f: impl FnOnce(&mut S::Connection) -> R,
    ) -> TransactionResult<R> {
        let inner = &self.coordinator.inner;
        let identity = self.identity(db);

        if let Some(entry) = inner.registry.lookup(&identity) {
            let shared = access == Access::Write || !entry.state.lock().for_update_only();
            if shared {
                return lend(&entry, f);
            }
            debug!(identity = %identity, "transaction is update-only, reading on a separate connection");
        }

        let conn = inner
            .source
            .acquire(db)
            .map_err(|e| TransactionError::resource(&identity, Operation::Acquire, e))?;
        let mut checkout = Checkout {
            source: &inner.source,
            db,
            conn: None,
        };
        Ok(f(checkout.conn.insert(conn)))
    }

    pub fn in_transaction<T, E, F>(&self, db: &DatabaseId, opts: TxOptions, f: F) -> Result<T, E>
    where
        F: FnOnce(&TransactionHandle<S>) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let mut tx = self.begin_with(db, opts)?;

        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = tx.rollback_if_not_committed() {
                    warn!(error = %rollback_error, "rollback after failed unit of work also failed");
                }
                Err(e)
            }
        }
    }
}

/// Connection taken from the source outside any transaction, released on
/// drop.
struct Checkout<'a, S: ConnectionSource> {
    source: &'a S,
    db: &'a DatabaseId,
    conn: Option<S::Connection>,
}

impl<S: ConnectionSource> Drop for Checkout<'_, S> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = self.source.release(conn, self.db) {
                warn!(db = %self.db, error = %e, "failed to release connection");
            }
        }
    }
}
