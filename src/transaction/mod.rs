//! Shared transaction coordination.
//!
//! Independent call sites on the same execution context share one physical
//! transaction per database without passing a connection around. Each
//! `begin` opens a nesting level on that transaction; only the close of the
//! outermost level commits or rolls back and returns the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Coordinator                           │
//! │   (begin / join, detach, connection routing, config)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │  Registry   │       │ Transaction │       │   Detach    │
//!  │ (identity → │       │   State     │       │   Guard     │
//!  │   entry)    │       │ (ref count) │       │             │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use txshare::db::DatabaseId;
//! use txshare::transaction::{Coordinator, TxOptions, IsolationLevel};
//!
//! let coordinator = Coordinator::new(pool);
//! let db = DatabaseId::new("orders");
//!
//! let mut outer = coordinator.begin(&db)?;
//! {
//!     // Somewhere deeper in the call chain: joins the same transaction.
//!     let mut inner = coordinator.begin_with(&db, TxOptions::new().isolation(IsolationLevel::Serializable))?;
//!     inner.with_connection(|conn| run_update(conn))??;
//!     inner.commit()?; // no I/O yet
//! }
//! outer.commit()?; // physical commit, connection released
//! ```

mod config;
mod coordinator;
mod detach;
mod error;
mod handle;
mod identity;
mod isolation;
mod registry;
mod state;

pub use config::{Access, CoordinatorConfig, TxOptions};
pub use coordinator::{Coordinator, Scope};
pub use error::{Operation, TransactionError, TransactionResult};
pub use handle::{TransactionHandle, TransactionInfo};
pub use identity::{ContextId, CreatorTag, TxIdentity};
pub use isolation::IsolationLevel;
pub use state::{Completion, CompletionHook, TxStatus};
