//! State machine of one physical transaction.
//!
//! ```text
//!            ┌──────────── rollback, refs > 0 ───────────┐
//!            │                                           ▼
//!        ┌────────┐   commit, refs == 0   ┌──────────────────────┐
//!        │ Active │──────────────────────▶│ FailedCommit (commit │──▶ Committed
//!        └────────┘                       │  in flight)          │
//!            │                            └──────────────────────┘
//!            │                                      │ driver error
//!            │ rollback, refs == 0                  ▼
//!            └──────────────▶ FailedRollback (rollback in flight) ──▶ RolledBack
//!                                    ▲
//!                 MarkedRollback ────┘ any close, refs == 0
//! ```
//!
//! A state is created by the first `begin` for an identity, shared by every
//! nested `begin` on the same identity, and finalized exactly once when its
//! reference count returns to zero.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::db::{Connection, DatabaseId};
use crate::transaction::error::{Operation, TransactionError, TransactionResult};
use crate::transaction::identity::TxIdentity;
use crate::transaction::isolation::IsolationLevel;

/// Lifecycle status of a shared transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Active,
    /// A participant asked to roll back; the final close will roll back.
    MarkedRollback,
    Committed,
    /// Physical commit in progress, or failed and awaiting rollback.
    FailedCommit,
    RolledBack,
    /// Physical rollback in progress, or failed.
    FailedRollback,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::RolledBack)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStatus::Active => "active",
            TxStatus::MarkedRollback => "marked rollback-only",
            TxStatus::Committed => "committed",
            TxStatus::FailedCommit => "failed commit",
            TxStatus::RolledBack => "rolled back",
            TxStatus::FailedRollback => "failed rollback",
        };
        f.write_str(name)
    }
}

/// How a shared transaction ended, as reported to completion hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Committed,
    RolledBack,
    /// Commit and rollback both failed; the outcome is unknown.
    Unknown,
}

/// Callback run once after the physical transaction is finalized.
pub type CompletionHook = Box<dyn FnOnce(Completion) + Send + 'static>;

/// Settings of one nesting level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LevelFrame {
    isolation: IsolationLevel,
    for_update_only: bool,
}

/// Where a finalized connection goes.
pub(crate) trait ConnectionSink<C> {
    /// `close` is false for connections borrowed from an external manager.
    fn dispose(&self, conn: C, db: &DatabaseId, close: bool);
}

/// Mutable state of one physical transaction.
pub(crate) struct TransactionState<C> {
    tx_id: Ulid,
    identity: TxIdentity,
    /// `None` once finalized, or while lent out to a caller.
    connection: Option<C>,
    status: TxStatus,
    ref_count: usize,
    /// Settings of the innermost open level.
    current: LevelFrame,
    /// Settings of the enclosing levels, innermost last. Always
    /// `ref_count - 1` entries while the transaction is open.
    outer: Vec<LevelFrame>,
    original_auto_commit: bool,
    original_isolation: IsolationLevel,
    close_connection: bool,
    started_at: DateTime<Utc>,
    hooks: Vec<CompletionHook>,
}

impl<C> TransactionState<C> {
    pub(crate) fn tx_id(&self) -> Ulid {
        self.tx_id
    }

    pub(crate) fn identity(&self) -> &TxIdentity {
        &self.identity
    }

    pub(crate) fn status(&self) -> TxStatus {
        self.status
    }

    pub(crate) fn ref_count(&self) -> usize {
        self.ref_count
    }

    pub(crate) fn isolation(&self) -> IsolationLevel {
        self.current.isolation
    }

    pub(crate) fn for_update_only(&self) -> bool {
        self.current.for_update_only
    }

    pub(crate) fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn is_open(&self) -> bool {
        self.ref_count > 0 && matches!(self.status, TxStatus::Active | TxStatus::MarkedRollback)
    }

    /// Doom the transaction: whoever closes the last level rolls back.
    pub(crate) fn mark_rollback_only(&mut self) {
        if self.status == TxStatus::Active {
            debug!(tx = %self.tx_id, ref_count = self.ref_count, "transaction marked rollback-only");
            self.status = TxStatus::MarkedRollback;
        }
    }

    /// Register a hook to run after finalize.
    pub(crate) fn push_hook(&mut self, hook: CompletionHook) {
        self.hooks.push(hook);
    }

    pub(crate) fn take_hooks(&mut self) -> Vec<CompletionHook> {
        std::mem::take(&mut self.hooks)
    }

    pub(crate) fn completion(&self) -> Completion {
        match self.status {
            TxStatus::Committed => Completion::Committed,
            TxStatus::RolledBack => Completion::RolledBack,
            _ => Completion::Unknown,
        }
    }

    /// Lend the connection out. It must come back through
    /// [`return_connection`](Self::return_connection).
    pub(crate) fn lend_connection(&mut self) -> TransactionResult<C> {
        if !self.is_open() {
            return Err(TransactionError::illegal_state(&self.identity, self.status, Operation::Execute));
        }
        self.connection
            .take()
            .ok_or_else(|| TransactionError::illegal_state(&self.identity, self.status, Operation::Execute))
    }

    pub(crate) fn return_connection(&mut self, conn: C) {
        self.connection = Some(conn);
    }

    pub(crate) fn has_connection(&self) -> bool {
        self.connection.is_some()
    }
}

impl<C: Connection> TransactionState<C> {
    /// Take ownership of `conn` and switch it into manual-commit mode.
    ///
    /// On failure the connection is handed back so the caller can release it.
    pub(crate) fn open(
        identity: TxIdentity,
        mut conn: C,
        close_connection: bool,
    ) -> Result<Self, (TransactionError, C)> {
        let original_auto_commit = match conn.auto_commit() {
            Ok(flag) => flag,
            Err(e) => {
                return Err((TransactionError::resource(&identity, Operation::SetAutoCommit, e), conn))
            }
        };
        let original_isolation = match conn.isolation() {
            Ok(level) => level,
            Err(e) => {
                return Err((TransactionError::resource(&identity, Operation::SetIsolation, e), conn))
            }
        };
        if original_auto_commit {
            if let Err(e) = conn.set_auto_commit(false) {
                return Err((TransactionError::resource(&identity, Operation::SetAutoCommit, e), conn));
            }
        }

        let tx_id = Ulid::new();
        debug!(tx = %tx_id, identity = %identity, borrowed = !close_connection, "opened transaction");

        Ok(Self {
            tx_id,
            identity,
            connection: Some(conn),
            status: TxStatus::Active,
            ref_count: 0,
            current: LevelFrame {
                isolation: original_isolation,
                for_update_only: false,
            },
            outer: Vec::new(),
            original_auto_commit,
            original_isolation,
            close_connection,
            started_at: Utc::now(),
            hooks: Vec::new(),
        })
    }

    /// Open one more nesting level with the requested settings.
    pub(crate) fn increment(
        &mut self,
        isolation: Option<IsolationLevel>,
        for_update_only: bool,
    ) -> TransactionResult<usize> {
        // A level opened while the connection is lent out could not be
        // closed until the lease returns.
        let conn = match self.connection.as_mut() {
            Some(conn) if self.status == TxStatus::Active => conn,
            _ => return Err(TransactionError::illegal_state(&self.identity, self.status, Operation::Begin)),
        };

        let previous = self.current;
        let level = isolation.unwrap_or(previous.isolation);
        if level != previous.isolation {
            conn.set_isolation(level)
                .map_err(|e| TransactionError::resource(&self.identity, Operation::SetIsolation, e))?;
        }

        if self.ref_count > 0 {
            self.outer.push(previous);
        }
        self.current = LevelFrame {
            isolation: level,
            for_update_only,
        };
        self.ref_count += 1;

        debug!(
            tx = %self.tx_id,
            ref_count = self.ref_count,
            isolation = %level,
            for_update_only,
            "entered transaction level"
        );
        Ok(self.ref_count)
    }

    /// Close the innermost nesting level and restore the settings of the
    /// enclosing one.
    pub(crate) fn decrement(&mut self, operation: Operation) -> TransactionResult<usize> {
        if self.ref_count == 0 {
            return Err(TransactionError::illegal_state(&self.identity, self.status, operation));
        }
        self.ref_count -= 1;
        if self.ref_count == 0 {
            return Ok(0);
        }

        if let Some(previous) = self.outer.pop() {
            if previous.isolation != self.current.isolation {
                if let Some(conn) = self.connection.as_mut() {
                    if let Err(e) = conn.set_isolation(previous.isolation) {
                        warn!(
                            tx = %self.tx_id,
                            isolation = %previous.isolation,
                            error = %e,
                            "failed to restore isolation level of enclosing transaction level"
                        );
                    }
                }
            }
            self.current = previous;
        }

        debug!(tx = %self.tx_id, ref_count = self.ref_count, "left transaction level");
        Ok(self.ref_count)
    }

    /// Physically end the transaction once the last level closed.
    ///
    /// `commit` requests a commit; a rollback-only transaction is rolled
    /// back regardless and reported as [`TransactionError::MarkedRollback`].
    /// The connection is restored and disposed on every path, including a
    /// panicking driver.
    pub(crate) fn complete(&mut self, commit: bool, sink: &dyn ConnectionSink<C>) -> TransactionResult<()> {
        let mut guard = Finalize { state: self, sink };
        let state = &mut *guard.state;

        if !commit {
            return state.physical_rollback();
        }
        match state.status {
            TxStatus::Active => state.physical_commit(),
            TxStatus::MarkedRollback => {
                state.physical_rollback()?;
                Err(TransactionError::MarkedRollback {
                    identity: state.identity.clone(),
                })
            }
            status => Err(TransactionError::illegal_state(&state.identity, status, Operation::Commit)),
        }
    }

    /// Give up a transaction that never opened its first level.
    pub(crate) fn discard(&mut self, sink: &dyn ConnectionSink<C>) {
        self.status = TxStatus::RolledBack;
        self.finalize(sink);
    }

    fn physical_commit(&mut self) -> TransactionResult<()> {
        self.status = TxStatus::FailedCommit;

        // A connection that was not in auto-commit mode belongs to someone
        // else's transaction boundary.
        if !self.original_auto_commit {
            debug!(tx = %self.tx_id, "commit boundary owned externally, skipping driver commit");
            self.status = TxStatus::Committed;
            return Ok(());
        }

        let result = match self.connection.as_mut() {
            Some(conn) => conn.commit(),
            None => return Err(TransactionError::illegal_state(&self.identity, self.status, Operation::Commit)),
        };
        match result {
            Ok(()) => {
                self.status = TxStatus::Committed;
                info!(tx = %self.tx_id, identity = %self.identity, "transaction committed");
                Ok(())
            }
            Err(commit_error) => {
                warn!(tx = %self.tx_id, error = %commit_error, "commit failed, rolling back");
                match self.physical_rollback() {
                    Ok(()) => Err(TransactionError::CommitFailed {
                        identity: self.identity.clone(),
                        source: commit_error,
                    }),
                    Err(TransactionError::Resource { source, .. }) => {
                        tracing::error!(
                            tx = %self.tx_id,
                            identity = %self.identity,
                            "commit and rollback both failed, connection state is indeterminate"
                        );
                        Err(TransactionError::Indeterminate {
                            identity: self.identity.clone(),
                            commit_error,
                            rollback_error: source,
                        })
                    }
                    Err(other) => Err(other),
                }
            }
        }
    }

    fn physical_rollback(&mut self) -> TransactionResult<()> {
        self.status = TxStatus::FailedRollback;
        let result = match self.connection.as_mut() {
            Some(conn) => conn.rollback(),
            None => return Err(TransactionError::illegal_state(&self.identity, self.status, Operation::Rollback)),
        };
        match result {
            Ok(()) => {
                self.status = TxStatus::RolledBack;
                info!(tx = %self.tx_id, identity = %self.identity, "transaction rolled back");
                Ok(())
            }
            Err(e) => Err(TransactionError::resource(&self.identity, Operation::Rollback, e)),
        }
    }

    /// Restore the connection's original settings and hand it off.
    /// Restore failures are logged, never surfaced.
    fn finalize(&mut self, sink: &dyn ConnectionSink<C>) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };

        if self.current.isolation != self.original_isolation {
            if let Err(e) = conn.set_isolation(self.original_isolation) {
                warn!(tx = %self.tx_id, error = %e, "failed to restore original isolation level");
            }
        }
        if self.original_auto_commit {
            if let Err(e) = conn.set_auto_commit(true) {
                warn!(tx = %self.tx_id, error = %e, "failed to restore auto-commit");
            }
        }
        self.outer.clear();
        sink.dispose(conn, &self.identity.db, self.close_connection);
    }
}

/// Runs finalize when dropped, so it happens on every exit path.
struct Finalize<'a, C: Connection> {
    state: &'a mut TransactionState<C>,
    sink: &'a dyn ConnectionSink<C>,
}

impl<C: Connection> Drop for Finalize<'_, C> {
    fn drop(&mut self) {
        self.state.finalize(self.sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, RecordingConnection, Script};
    use crate::transaction::identity::{ContextId, CreatorTag};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Sink {
        disposed: Mutex<Vec<(usize, bool)>>,
    }

    impl ConnectionSink<RecordingConnection> for Sink {
        fn dispose(&self, conn: RecordingConnection, _db: &DatabaseId, close: bool) {
            self.disposed.lock().push((conn.id(), close));
        }
    }

    fn open(script: &Script) -> TransactionState<RecordingConnection> {
        let identity = TxIdentity::new(DatabaseId::new("orders"), ContextId::fresh(), CreatorTag::new("test"));
        TransactionState::open(identity, RecordingConnection::new(script.clone()), true)
            .map_err(|(e, _)| e)
            .unwrap()
    }

    #[test]
    fn test_open_disables_auto_commit() {
        let script = Script::default();
        let state = open(&script);
        assert_eq!(state.status(), TxStatus::Active);
        assert_eq!(state.ref_count(), 0);
        assert!(!script.auto_commit_of(1));
    }

    #[test]
    fn test_levels_keep_one_frame_per_enclosing_level() {
        let script = Script::default();
        let mut state = open(&script);

        assert_eq!(state.increment(None, false).unwrap(), 1);
        assert!(state.outer.is_empty());
        assert_eq!(state.increment(None, true).unwrap(), 2);
        assert_eq!(state.increment(None, false).unwrap(), 3);
        assert_eq!(state.outer.len(), 2);
        assert!(!state.for_update_only());

        assert_eq!(state.decrement(Operation::Commit).unwrap(), 2);
        assert_eq!(state.outer.len(), 1);
        assert!(state.for_update_only());
        assert_eq!(state.decrement(Operation::Commit).unwrap(), 1);
        assert!(state.outer.is_empty());
        assert!(!state.for_update_only());
    }

    #[test]
    fn test_nested_isolation_is_restored() {
        let script = Script::default();
        let mut state = open(&script);

        state.increment(Some(IsolationLevel::RepeatableRead), false).unwrap();
        state.increment(Some(IsolationLevel::Serializable), false).unwrap();
        assert_eq!(script.isolation_of(1), IsolationLevel::Serializable);

        // Default keeps the enclosing level's setting.
        state.increment(None, false).unwrap();
        assert_eq!(state.isolation(), IsolationLevel::Serializable);

        state.decrement(Operation::Commit).unwrap();
        state.decrement(Operation::Commit).unwrap();
        assert_eq!(script.isolation_of(1), IsolationLevel::RepeatableRead);
        assert_eq!(state.isolation(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_failed_isolation_change_leaves_level_count() {
        let script = Script::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();

        script.fail_isolation(true);
        let err = state.increment(Some(IsolationLevel::Serializable), false).unwrap_err();
        assert!(err.is_resource());
        assert_eq!(state.ref_count(), 1);
        assert!(state.outer.is_empty());
    }

    #[test]
    fn test_decrement_below_zero_is_illegal() {
        let script = Script::default();
        let mut state = open(&script);
        let err = state.decrement(Operation::Commit).unwrap_err();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_begin_on_marked_transaction_is_illegal() {
        let script = Script::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();
        state.mark_rollback_only();
        assert_eq!(state.status(), TxStatus::MarkedRollback);
        assert!(state.increment(None, false).unwrap_err().is_illegal_state());
    }

    #[test]
    fn test_begin_while_connection_lent_is_illegal() {
        let script = Script::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();

        let conn = state.lend_connection().unwrap();
        assert!(state.increment(None, false).unwrap_err().is_illegal_state());
        assert_eq!(state.ref_count(), 1);
        assert!(state.outer.is_empty());

        state.return_connection(conn);
        assert_eq!(state.increment(None, false).unwrap(), 2);
    }

    #[test]
    fn test_complete_commit_finalizes() {
        let script = Script::default();
        let sink = Sink::default();
        let mut state = open(&script);
        state.increment(Some(IsolationLevel::Serializable), false).unwrap();
        state.decrement(Operation::Commit).unwrap();

        state.complete(true, &sink).unwrap();
        assert_eq!(state.status(), TxStatus::Committed);
        assert_eq!(state.completion(), Completion::Committed);
        assert_eq!(script.commits(), 1);
        assert_eq!(script.isolation_of(1), IsolationLevel::ReadCommitted);
        assert!(script.auto_commit_of(1));
        assert_eq!(*sink.disposed.lock(), vec![(1, true)]);
        assert!(!state.has_connection());
    }

    #[test]
    fn test_commit_failure_rolls_back() {
        let script = Script::default();
        let sink = Sink::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();
        state.decrement(Operation::Commit).unwrap();

        script.fail_commit(true);
        let err = state.complete(true, &sink).unwrap_err();
        assert!(matches!(err, TransactionError::CommitFailed { .. }));
        assert_eq!(state.status(), TxStatus::RolledBack);
        assert_eq!(script.rollbacks(), 1);
        assert_eq!(sink.disposed.lock().len(), 1);
    }

    #[test]
    fn test_commit_and_rollback_failure_is_indeterminate() {
        let script = Script::default();
        let sink = Sink::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();
        state.decrement(Operation::Commit).unwrap();

        script.fail_commit(true);
        script.fail_rollback(true);
        let err = state.complete(true, &sink).unwrap_err();
        assert!(err.is_indeterminate());
        assert_eq!(state.completion(), Completion::Unknown);
        // The connection is still handed back exactly once.
        assert_eq!(sink.disposed.lock().len(), 1);
    }

    #[test]
    fn test_marked_rollback_turns_commit_into_rollback() {
        let script = Script::default();
        let sink = Sink::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();
        state.mark_rollback_only();
        state.decrement(Operation::Commit).unwrap();

        let err = state.complete(true, &sink).unwrap_err();
        assert!(matches!(err, TransactionError::MarkedRollback { .. }));
        assert_eq!(script.commits(), 0);
        assert_eq!(script.rollbacks(), 1);
        assert_eq!(state.status(), TxStatus::RolledBack);
    }

    #[test]
    fn test_restore_failure_does_not_mask_commit() {
        let script = Script::default();
        let sink = Sink::default();
        let mut state = open(&script);
        state.increment(None, false).unwrap();
        state.decrement(Operation::Commit).unwrap();

        script.fail_auto_commit(true);
        state.complete(true, &sink).unwrap();
        assert_eq!(state.status(), TxStatus::Committed);
        assert_eq!(sink.disposed.lock().len(), 1);
    }

    #[test]
    fn test_borrowed_connection_is_not_committed() {
        let script = Script::default();
        let sink = Sink::default();
        let identity = TxIdentity::new(DatabaseId::new("orders"), ContextId::fresh(), CreatorTag::new("test"));
        let conn = RecordingConnection::with_auto_commit(script.clone(), false);
        let mut state = TransactionState::open(identity, conn, false).map_err(|(e, _)| e).unwrap();
        state.increment(None, false).unwrap();
        state.decrement(Operation::Commit).unwrap();

        state.complete(true, &sink).unwrap();
        assert_eq!(script.commits(), 0);
        assert!(!script.events().iter().any(|e| matches!(e, Event::AutoCommit(..))));
        assert_eq!(*sink.disposed.lock(), vec![(1, false)]);
    }
}
