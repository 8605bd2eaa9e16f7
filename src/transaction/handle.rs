//! Handle held by one participant of a shared transaction.
//!
//! Every `begin` returns its own handle. Each handle closes exactly one
//! nesting level; only the close that brings the level count to zero
//! touches the database.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::db::{Connection, ConnectionSource};
use crate::transaction::coordinator::CoordinatorInner;
use crate::transaction::error::{Operation, TransactionError, TransactionResult};
use crate::transaction::identity::TxIdentity;
use crate::transaction::isolation::IsolationLevel;
use crate::transaction::registry::TxEntry;
use crate::transaction::state::{Completion, TransactionState, TxStatus};

/// Snapshot of a shared transaction, for introspection and logging.
#[derive(Debug, Clone, Serialize)]
pub struct TransactionInfo {
    pub tx_id: String,
    pub identity: TxIdentity,
    pub status: TxStatus,
    pub ref_count: usize,
    /// Isolation level of the innermost open level.
    pub isolation: IsolationLevel,
    pub for_update_only: bool,
    pub started_at: DateTime<Utc>,
}

impl TransactionInfo {
    pub(crate) fn from_state<C>(state: &TransactionState<C>) -> Self {
        Self {
            tx_id: state.tx_id().to_string().to_lowercase(),
            identity: state.identity().clone(),
            status: state.status(),
            ref_count: state.ref_count(),
            isolation: state.isolation(),
            for_update_only: state.for_update_only(),
            started_at: state.started_at(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Close {
    Commit,
    Rollback,
    RollbackIfNotCommitted,
}

impl Close {
    fn operation(self) -> Operation {
        match self {
            Close::Commit => Operation::Commit,
            Close::Rollback | Close::RollbackIfNotCommitted => Operation::Rollback,
        }
    }
}

/// One participant's view of a shared transaction.
///
/// Dropping a handle that was never closed rolls its level back, which
/// dooms the whole shared transaction.
pub struct TransactionHandle<S: ConnectionSource> {
    inner: Arc<CoordinatorInner<S>>,
    entry: Arc<TxEntry<S::Connection>>,
    closed: Option<Close>,
}

impl<S: ConnectionSource> TransactionHandle<S> {
    pub(crate) fn new(inner: Arc<CoordinatorInner<S>>, entry: Arc<TxEntry<S::Connection>>) -> Self {
        Self {
            inner,
            entry,
            closed: None,
        }
    }

    /// Unique id of the physical transaction, shared by every participant.
    pub fn id(&self) -> Ulid {
        self.entry.state.lock().tx_id()
    }

    pub fn identity(&self) -> &TxIdentity {
        self.entry.identity()
    }

    pub fn status(&self) -> TxStatus {
        self.entry.state.lock().status()
    }

    /// Number of participants still holding a level open.
    pub fn ref_count(&self) -> usize {
        self.entry.state.lock().ref_count()
    }

    /// Isolation level of the innermost open level.
    pub fn isolation(&self) -> IsolationLevel {
        self.entry.state.lock().isolation()
    }

    /// Whether the innermost open level is update-only.
    pub fn for_update_only(&self) -> bool {
        self.entry.state.lock().for_update_only()
    }

    /// When the physical transaction was opened.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.entry.state.lock().started_at()
    }

    /// Whether this handle has closed its level.
    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn info(&self) -> TransactionInfo {
        TransactionInfo::from_state(&self.entry.state.lock())
    }

    /// Run `hook` once the physical transaction has been finalized.
    pub fn after_completion<F>(&self, hook: F) -> TransactionResult<()>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let mut state = self.entry.state.lock();
        if !state.is_open() {
            return Err(TransactionError::illegal_state(
                self.entry.identity(),
                state.status(),
                Operation::Execute,
            ));
        }
        state.push_hook(Box::new(hook));
        Ok(())
    }

    /// Run `f` on the shared connection.
    ///
    /// The connection is lent out for the duration of `f`; beginning or
    /// closing a level of this same transaction from inside `f` fails with
    /// an illegal-state error.
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut S::Connection) -> R) -> TransactionResult<R> {
        lend(&self.entry, f)
    }

    /// Close this level, committing if it is the last one open.
    pub fn commit(&mut self) -> TransactionResult<()> {
        self.close(Close::Commit)
    }

    /// Close this level and doom the shared transaction. The physical
    /// rollback happens when the last level closes.
    pub fn rollback(&mut self) -> TransactionResult<()> {
        self.close(Close::Rollback)
    }

    /// Roll back unless this handle already closed its level. Meant for
    /// cleanup paths that run whether or not `commit` was reached.
    pub fn rollback_if_not_committed(&mut self) -> TransactionResult<()> {
        self.close(Close::RollbackIfNotCommitted)
    }

    fn close(&mut self, how: Close) -> TransactionResult<()> {
        let operation = how.operation();
        let mut state = self.entry.state.lock();

        if self.closed.is_some() {
            if how == Close::RollbackIfNotCommitted {
                return Ok(());
            }
            if state.ref_count() == 0 {
                warn!(
                    tx = %state.tx_id(),
                    status = %state.status(),
                    "{operation} on a transaction that is already closed, ignoring"
                );
                return Ok(());
            }
            return Err(TransactionError::illegal_state(self.entry.identity(), state.status(), operation));
        }

        if state.ref_count() == 0 || state.status().is_terminal() {
            warn!(
                tx = %state.tx_id(),
                status = %state.status(),
                "{operation} on a transaction that is already closed, ignoring"
            );
            self.closed = Some(how);
            return Ok(());
        }
        if !state.has_connection() {
            return Err(TransactionError::illegal_state(self.entry.identity(), state.status(), operation));
        }

        let remaining = state.decrement(operation)?;
        self.closed = Some(how);
        if remaining > 0 {
            if how != Close::Commit {
                state.mark_rollback_only();
            }
            return Ok(());
        }

        self.inner.registry.remove_if_same(&self.entry);
        let result = state.complete(how == Close::Commit, &*self.inner);
        let hooks = state.take_hooks();
        let completion = state.completion();
        drop(state);

        for hook in hooks {
            hook(completion);
        }
        result
    }
}

impl<S: ConnectionSource> Drop for TransactionHandle<S> {
    fn drop(&mut self) {
        if self.closed.is_some() {
            return;
        }
        if self.inner.config.warn_on_implicit_rollback {
            warn!(identity = %self.entry.identity(), "transaction handle dropped without close, rolling back");
        } else {
            debug!(identity = %self.entry.identity(), "transaction handle dropped without close, rolling back");
        }
        if let Err(e) = self.close(Close::RollbackIfNotCommitted) {
            error!(identity = %self.entry.identity(), error = %e, "implicit rollback failed");
        }
    }
}

impl<S: ConnectionSource> std::fmt::Debug for TransactionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("identity", self.entry.identity())
            .field("closed", &self.closed.is_some())
            .finish()
    }
}

/// Lends a transaction's connection back on drop.
struct Lease<'a, C> {
    entry: &'a TxEntry<C>,
    conn: Option<C>,
}

impl<C> Drop for Lease<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.entry.state.lock().return_connection(conn);
        }
    }
}

/// Run `f` on the connection of `entry` without holding its state lock.
pub(crate) fn lend<C: Connection, R>(entry: &TxEntry<C>, f: impl FnOnce(&mut C) -> R) -> TransactionResult<R> {
    let conn = entry.state.lock().lend_connection()?;
    let mut lease = Lease { entry, conn: None };
    let conn = lease.conn.insert(conn);
    Ok(f(conn))
}
