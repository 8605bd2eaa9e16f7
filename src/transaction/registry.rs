//! Process-wide map from identity to the transaction it currently shares.
//!
//! An entry exists exactly while its transaction has open levels. Entries are
//! only ever mutated by the context named in their key, so the map needs
//! atomic insert/remove/lookup and nothing more.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::transaction::identity::TxIdentity;
use crate::transaction::state::TransactionState;

/// One registered transaction.
pub(crate) struct TxEntry<C> {
    identity: TxIdentity,
    /// Held while the entry is detached from the registry.
    detach_lock: Mutex<()>,
    pub(crate) state: Mutex<TransactionState<C>>,
}

impl<C> TxEntry<C> {
    pub(crate) fn new(identity: TxIdentity, state: TransactionState<C>) -> Self {
        Self {
            identity,
            detach_lock: Mutex::new(()),
            state: Mutex::new(state),
        }
    }

    pub(crate) fn identity(&self) -> &TxIdentity {
        &self.identity
    }

    pub(crate) fn detach_lock(&self) -> &Mutex<()> {
        &self.detach_lock
    }
}

/// Registry of active shared transactions.
pub(crate) struct Registry<C> {
    entries: RwLock<HashMap<TxIdentity, Arc<TxEntry<C>>>>,
}

impl<C> Registry<C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn lookup(&self, identity: &TxIdentity) -> Option<Arc<TxEntry<C>>> {
        self.entries.read().get(identity).cloned()
    }

    /// Insert or replace the entry for `entry.identity`, returning the one
    /// it displaced.
    pub(crate) fn put(&self, entry: Arc<TxEntry<C>>) -> Option<Arc<TxEntry<C>>> {
        self.entries.write().insert(entry.identity.clone(), entry)
    }

    pub(crate) fn remove(&self, identity: &TxIdentity) -> Option<Arc<TxEntry<C>>> {
        self.entries.write().remove(identity)
    }

    /// Remove the entry for `entry.identity` only if it is `entry` itself.
    ///
    /// A transaction leaked out of a detached scope may close after its
    /// identity was handed back to the enclosing transaction; it must not
    /// unregister that one.
    pub(crate) fn remove_if_same(&self, entry: &Arc<TxEntry<C>>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&entry.identity) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                entries.remove(&entry.identity);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub(crate) fn entries(&self) -> Vec<Arc<TxEntry<C>>> {
        self.entries.read().values().cloned().collect()
    }
}
