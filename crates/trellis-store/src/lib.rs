//! The revision store: per-document revision trees, bodies and the change
//! log on top of a `KvBackend`, with MVCC and forced inserts, validation,
//! conflict resolution and commit notifications.
//!
//! Every operation runs on a [`Transaction`] obtained from
//! [`Database::in_transaction`]; the async methods on [`Database`] are thin
//! wrappers that open one per call.

pub mod changes;
pub mod database;
pub mod insertion;
mod local;
pub mod store;
pub mod transaction;
pub mod validation;

pub use changes::{ChangesOptions, ChangesPage, DatabaseChange, Filter, FilterSpec, RevisionChange};
pub use database::{DEFAULT_MAX_REV_TREE_DEPTH, Database, DatabaseOptions};
pub use insertion::{ForceInsertOutcome, PutRevision, Resolution};
pub use store::PurgeTarget;
pub use transaction::Transaction;
pub use validation::{ValidationContext, Validator};
