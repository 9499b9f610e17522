//! Core types for trellis: revision IDs, revisions, the per-document
//! revision tree, wire formats, the storage backend trait and the remote
//! peer trait.

pub mod document;
pub mod error;
pub mod kv;
pub mod peer;
pub mod rev_id;
pub mod rev_tree;
pub mod revision;

pub use error::{Result, TrellisError};
pub use rev_id::RevId;
pub use revision::{Body, Revision, RevisionList};
