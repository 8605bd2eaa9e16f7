//! Temporarily hiding a transaction from its own identity.
//!
//! While detached, a `begin` on the same identity opens a brand-new
//! transaction instead of joining the hidden one. Reattachment happens when
//! the guard is consumed or dropped, so it also runs on early return and
//! unwinding.

use std::sync::Arc;

use parking_lot::MutexGuard;
use tracing::{debug, error};

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::registry::{Registry, TxEntry};

/// Keeps one transaction out of the registry until reattached.
pub(crate) struct DetachGuard<'a, C> {
    registry: &'a Registry<C>,
    entry: &'a Arc<TxEntry<C>>,
    attached: bool,
    _held: MutexGuard<'a, ()>,
}

impl<'a, C> DetachGuard<'a, C> {
    /// Remove `entry` from `registry` under its detach lock.
    pub(crate) fn detach(registry: &'a Registry<C>, entry: &'a Arc<TxEntry<C>>) -> Self {
        let held = entry.detach_lock().lock();
        registry.remove(entry.identity());
        debug!(identity = %entry.identity(), "detached transaction");
        Self {
            registry,
            entry,
            attached: false,
            _held: held,
        }
    }

    /// Put the transaction back, failing if the detached scope left another
    /// transaction registered under the same identity.
    pub(crate) fn reattach(mut self) -> TransactionResult<()> {
        self.attached = true;
        self.put_back()
    }

    fn put_back(&self) -> TransactionResult<()> {
        // The detached scope may have closed this transaction through a
        // captured handle; a finished transaction stays out, but whatever
        // the scope left registered is still a leak.
        let displaced = if self.entry.state.lock().is_open() {
            self.registry.put(self.entry.clone())
        } else {
            debug!(identity = %self.entry.identity(), "detached transaction closed while detached");
            let left = self.registry.lookup(self.entry.identity());
            if let Some(other) = &left {
                self.registry.remove_if_same(other);
            }
            left
        };

        match displaced {
            Some(other) if !Arc::ptr_eq(&other, self.entry) => {
                let leaked = other.state.lock().tx_id();
                error!(
                    identity = %self.entry.identity(),
                    leaked = %leaked,
                    "detached scope left a transaction open"
                );
                Err(TransactionError::LeakedTransaction {
                    identity: self.entry.identity().clone(),
                })
            }
            _ => {
                debug!(identity = %self.entry.identity(), "reattached transaction");
                Ok(())
            }
        }
    }
}

impl<C> Drop for DetachGuard<'_, C> {
    fn drop(&mut self) {
        if !self.attached {
            // Unwinding: the error, if any, is already logged.
            let _ = self.put_back();
        }
    }
}
