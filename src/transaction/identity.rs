//! Keys that decide which callers share a transaction.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::DatabaseId;

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);
static NEXT_CREATOR: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_CONTEXT: ContextId = ContextId::fresh();
}

/// Identity of an execution context.
///
/// Calls made under the same context (and the same database and creator)
/// share one transaction. By default that context is the calling thread;
/// callers that hop between threads can allocate a context explicitly and
/// pass it through [`Coordinator::scope`](super::Coordinator::scope).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(u64);

impl ContextId {
    /// The context of the calling thread. Stable for the thread's lifetime.
    pub fn current() -> Self {
        THREAD_CONTEXT.with(|ctx| *ctx)
    }

    /// A context no other caller has.
    pub fn fresh() -> Self {
        Self(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Distinguishes independently coordinated transaction families that share
/// a context and database. Every coordinator gets its own tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreatorTag {
    name: Arc<str>,
    serial: u64,
}

impl CreatorTag {
    /// Allocate a tag that is unique within the process.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            serial: NEXT_CREATOR.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for CreatorTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.serial)
    }
}

/// Registry key of a shared transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxIdentity {
    pub db: DatabaseId,
    pub context: ContextId,
    pub creator: CreatorTag,
}

impl TxIdentity {
    pub fn new(db: DatabaseId, context: ContextId, creator: CreatorTag) -> Self {
        Self {
            db,
            context,
            creator,
        }
    }
}

impl fmt::Display for TxIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.db, self.context, self.creator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_context_is_per_thread() {
        let here = ContextId::current();
        assert_eq!(here, ContextId::current());

        let there = std::thread::spawn(ContextId::current).join().unwrap();
        assert_ne!(here, there);
    }

    #[test]
    fn test_fresh_contexts_are_distinct() {
        assert_ne!(ContextId::fresh(), ContextId::fresh());
        assert_ne!(ContextId::fresh(), ContextId::current());
    }

    #[test]
    fn test_creator_tags_are_distinct() {
        let a = CreatorTag::new("app");
        let b = CreatorTag::new("app");
        assert_ne!(a, b);
        assert_eq!(a.name(), "app");
    }

    #[test]
    fn test_identity_display() {
        let ctx = ContextId::fresh();
        let creator = CreatorTag::new("app");
        let id = TxIdentity::new(DatabaseId::new("orders"), ctx, creator.clone());
        let shown = id.to_string();
        assert!(shown.starts_with("orders@ctx-"));
        assert!(shown.ends_with(&creator.to_string()));
    }
}
