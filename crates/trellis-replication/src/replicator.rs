//! The replicator state machine.
//!
//! A [`Replicator`] owns one supervisor task. The supervisor runs push or
//! pull sessions back to back: it gates them on the network status, retries
//! failed sessions with backoff and decides which errors stop the
//! replication for good.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::Peer;
use trellis_core::revision::RevisionList;
use trellis_store::{Database, Resolution};

use crate::checkpoint::CheckpointManager;
use crate::settings::{Direction, NetworkStatus, ReplicationSettings, backoff_delay};
use crate::{pull, push};

/// Consecutive transport errors after which the replicator reports itself
/// offline.
pub const OFFLINE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplicationState {
    #[default]
    Stopped,
    Starting,
    /// Waiting for the network, or too many transport errors in a row.
    Offline,
    Active,
    /// Continuous, caught up and with nothing pending.
    Idle,
    Stopping,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStatus {
    pub state: ReplicationState,
    pub changes_processed: u64,
    pub changes_total: u64,
    /// The most recent error. Kept after the replicator stops.
    pub error: Option<TrellisError>,
}

/// Called after each pulled batch for every document left in conflict,
/// with its live leaves, winner first. `None` leaves the conflict alone.
pub type ConflictResolver = Arc<dyn Fn(&str, &RevisionList) -> Option<Resolution> + Send + Sync>;

// ---------------------------------------------------------------------------
// Session context
// ---------------------------------------------------------------------------

/// What a push or pull session needs, plus the status it reports into.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub db: Database,
    pub peer: Arc<dyn Peer>,
    pub settings: ReplicationSettings,
    pub resolver: Option<ConflictResolver>,
    status: Arc<watch::Sender<ReplicationStatus>>,
    failures: Arc<AtomicU32>,
    retry: watch::Receiver<u64>,
}

impl SessionContext {
    pub(crate) fn set_state(&self, state: ReplicationState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            debug!(from = ?status.state, to = ?state, "replication state");
            status.state = state;
            true
        });
    }

    /// Revisions seen on the source that this session will process.
    pub(crate) fn discovered(&self, n: u64) {
        self.status.send_modify(|status| status.changes_total += n);
    }

    /// `n` changes are done. Any progress clears the transport error
    /// streak and brings the replicator back online.
    pub(crate) fn progressed(&self, n: u64) {
        self.failures.store(0, Ordering::Relaxed);
        self.status.send_modify(|status| {
            status.changes_processed += n;
            if matches!(
                status.state,
                ReplicationState::Starting | ReplicationState::Offline | ReplicationState::Idle
            ) {
                status.state = ReplicationState::Active;
            }
        });
    }

    /// Record a transport error. Returns the length of the current streak.
    pub(crate) fn transport_error(&self, error: &TrellisError) -> u32 {
        let streak = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.status.send_modify(|status| {
            status.error = Some(error.clone());
            if streak >= OFFLINE_THRESHOLD {
                status.state = ReplicationState::Offline;
            }
        });
        streak
    }

    pub(crate) fn retry_signal(&self) -> watch::Receiver<u64> {
        self.retry.clone()
    }
}

// ---------------------------------------------------------------------------
// Replicator
// ---------------------------------------------------------------------------

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Replicator {
    db: Database,
    peer: Arc<dyn Peer>,
    settings: ReplicationSettings,
    resolver: Option<ConflictResolver>,
    status: Arc<watch::Sender<ReplicationStatus>>,
    network: watch::Sender<NetworkStatus>,
    retry: watch::Sender<u64>,
    running: Mutex<Option<Running>>,
}

impl Replicator {
    pub fn new(db: Database, peer: Arc<dyn Peer>, settings: ReplicationSettings) -> Result<Self> {
        settings.validate()?;
        let (status, _) = watch::channel(ReplicationStatus::default());
        let (network, _) = watch::channel(NetworkStatus::default());
        let (retry, _) = watch::channel(0);
        Ok(Self {
            db,
            peer,
            settings,
            resolver: None,
            status: Arc::new(status),
            network,
            retry,
            running: Mutex::new(None),
        })
    }

    pub fn with_conflict_resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn settings(&self) -> &ReplicationSettings {
        &self.settings
    }

    fn running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start replicating. Does nothing while a run is already going.
    pub fn start(&self) {
        let mut running = self.running();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }
        self.status.send_modify(|status| {
            *status = ReplicationStatus {
                state: ReplicationState::Starting,
                ..Default::default()
            }
        });
        info!(
            remote = %self.peer.identity(),
            direction = self.settings.direction.as_str(),
            continuous = self.settings.continuous,
            "replication starting"
        );

        let cancel = CancellationToken::new();
        let ctx = SessionContext {
            db: self.db.clone(),
            peer: self.peer.clone(),
            settings: self.settings.clone(),
            resolver: self.resolver.clone(),
            status: self.status.clone(),
            failures: Arc::new(AtomicU32::new(0)),
            retry: self.retry.subscribe(),
        };
        let network = self.network.subscribe();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let error = supervise(&ctx, token, network).await;
            if let Some(e) = &error {
                warn!(error = %e, "replication stopped with error");
            } else {
                info!("replication stopped");
            }
            ctx.status.send_modify(|status| {
                status.state = ReplicationState::Stopped;
                if error.is_some() {
                    status.error = error;
                }
            });
        });
        *running = Some(Running { cancel, task });
    }

    /// Stop and wait until `Stopped` has been published. Safe to call any
    /// number of times.
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };
        if !running.task.is_finished() {
            self.status.send_if_modified(|status| {
                if status.state == ReplicationState::Stopped {
                    return false;
                }
                status.state = ReplicationState::Stopping;
                true
            });
        }
        running.cancel.cancel();
        if let Err(e) = running.task.await {
            warn!(error = %e, "replication task failed");
            self.status
                .send_modify(|status| status.state = ReplicationState::Stopped);
        }
    }

    /// Skip the current backoff and try again now.
    pub fn retry(&self) {
        self.retry.send_modify(|n| *n += 1);
    }

    /// Report a change in connectivity.
    pub fn set_network(&self, status: NetworkStatus) {
        self.network.send_replace(status);
    }

    pub fn subscribe(&self) -> watch::Receiver<ReplicationStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> ReplicationStatus {
        self.status.borrow().clone()
    }

    /// Wait until the replicator is stopped. Returns at once if it never
    /// started.
    pub async fn wait_for_stopped(&self) -> ReplicationStatus {
        let mut rx = self.status.subscribe();
        match rx.wait_for(|s| s.state == ReplicationState::Stopped).await {
            Ok(status) => status.clone(),
            Err(_) => self.status(),
        }
    }
}

impl Drop for Replicator {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.cancel.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Errors that stop the replication on first sight.
fn stops_immediately(error: &TrellisError) -> bool {
    error.is_fatal()
        || matches!(
            error,
            TrellisError::BadRequest(_)
                | TrellisError::BadId(_)
                | TrellisError::InvalidRev(_)
                | TrellisError::ValidationRejected(_)
        )
}

fn is_permanent_network(error: &TrellisError) -> bool {
    matches!(
        error,
        TrellisError::PermanentNetwork { .. }
            | TrellisError::NotFound(_)
            | TrellisError::Conflict
            | TrellisError::Json(_)
    )
}

async fn run_session(ctx: &SessionContext, cancel: CancellationToken) -> Result<()> {
    match ctx.settings.direction {
        Direction::Push => push::run(ctx, cancel).await,
        Direction::Pull => pull::run(ctx, cancel).await,
    }
}

/// Run sessions until done, stopped or failed. Returns the error that
/// ended the replication, if any.
async fn supervise(
    ctx: &SessionContext,
    cancel: CancellationToken,
    mut network: watch::Receiver<NetworkStatus>,
) -> Option<TrellisError> {
    let settings = &ctx.settings;
    let mut retry = ctx.retry_signal();

    if settings.reset {
        let manager = CheckpointManager::new(ctx.db.clone(), ctx.peer.clone(), settings);
        if let Err(e) = manager.reset().await {
            return Some(e);
        }
    }

    let mut permanent_failures = 0u32;
    loop {
        if cancel.is_cancelled() {
            return None;
        }

        let reachable = *network.borrow_and_update();
        if !settings.network.allows(reachable) {
            info!(network = ?reachable, "network unavailable, waiting");
            ctx.set_state(ReplicationState::Offline);
            tokio::select! {
                _ = cancel.cancelled() => return None,
                Ok(()) = network.changed() => {}
                Ok(()) = retry.changed() => {}
            }
            continue;
        }

        let session_cancel = cancel.child_token();
        let session = run_session(ctx, session_cancel.clone());
        tokio::pin!(session);
        let result = loop {
            tokio::select! {
                result = &mut session => break result,
                Ok(()) = network.changed(), if !session_cancel.is_cancelled() => {
                    let now = *network.borrow_and_update();
                    if !settings.network.allows(now) {
                        info!(network = ?now, "network lost, pausing session");
                        session_cancel.cancel();
                    }
                }
            }
        };

        if cancel.is_cancelled() {
            return None;
        }
        let error = match result {
            // Paused for the network; the next pass goes offline.
            Ok(()) if session_cancel.is_cancelled() => continue,
            Ok(()) => return None,
            Err(e) => e,
        };

        if stops_immediately(&error) {
            return Some(error);
        }
        if is_permanent_network(&error) {
            permanent_failures += 1;
            if permanent_failures > settings.permanent_retry_limit() {
                return Some(error);
            }
        }
        let attempt = ctx.transport_error(&error);
        if !settings.continuous && !settings.max_retries.allows(attempt) {
            return Some(error);
        }
        let delay = backoff_delay(
            settings.retry_initial_delay(),
            settings.retry_max_delay(),
            attempt,
        );
        info!(error = %error, attempt, ?delay, "replication session failed, retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            Ok(()) = retry.changed() => debug!("retry requested"),
            Ok(()) = network.changed() => {}
            _ = cancel.cancelled() => return None,
        }
    }
}
