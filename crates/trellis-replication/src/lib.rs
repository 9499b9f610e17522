//! Replication for trellis: the change tracker, checkpoints and the
//! push/pull state machine that moves revisions between a local
//! [`Database`](trellis_store::Database) and any [`Peer`](trellis_core::peer::Peer).

pub mod batcher;
pub mod checkpoint;
pub mod local;
mod pull;
mod push;
pub mod replicator;
pub mod sequence_map;
pub mod settings;
pub mod tracker;

pub use checkpoint::{Checkpoint, CheckpointManager, CheckpointSaver, checkpoint_id};
pub use local::LocalPeer;
pub use replicator::{ConflictResolver, OFFLINE_THRESHOLD, ReplicationState, ReplicationStatus, Replicator};
pub use settings::{Direction, MaxRetries, NetworkPolicy, NetworkStatus, ReplicationSettings};
pub use tracker::{ChangeTracker, TrackerEvent, TrackerOptions};
