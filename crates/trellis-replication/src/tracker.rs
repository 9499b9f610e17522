//! Client side of a remote change feed.
//!
//! The tracker keeps one feed open (re-opening it as the mode requires),
//! reports every row in arrival order and retries transport failures with
//! exponential backoff, resuming from the last sequence it received.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::document::{ChangesRequest, FeedEvent, FeedMode, Seq};
use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::Peer;
use trellis_core::rev_id::RevId;

use crate::settings::{MaxRetries, ReplicationSettings, backoff_delay};

#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    Received {
        sequence: Seq,
        doc_id: String,
        rev_ids: Vec<RevId>,
        deleted: bool,
    },
    /// The first backlog has been delivered. Sent once.
    CaughtUp,
    /// A transport failure; the feed will be re-opened after `delay`.
    Retrying {
        error: TrellisError,
        attempt: u32,
        delay: Duration,
    },
    /// Last event. `error` is set when the tracker gave up.
    Finished { error: Option<TrellisError> },
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub mode: FeedMode,
    /// Part of a continuous replication: retry without limit.
    pub continuous: bool,
    pub since: Seq,
    pub filter: Option<String>,
    pub filter_params: Map<String, Value>,
    pub doc_ids: Option<Vec<String>>,
    pub heartbeat: Duration,
    pub request_timeout: Duration,
    pub max_retries: MaxRetries,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
}

impl TrackerOptions {
    pub fn from_settings(settings: &ReplicationSettings, since: Seq) -> Self {
        Self {
            mode: settings.feed_mode(),
            continuous: settings.continuous,
            since,
            filter: settings.filter_name.clone(),
            filter_params: settings.filter_params.clone(),
            doc_ids: settings.doc_ids.clone(),
            heartbeat: settings.heartbeat(),
            request_timeout: settings.request_timeout(),
            max_retries: settings.max_retries,
            retry_initial_delay: settings.retry_initial_delay(),
            retry_max_delay: settings.retry_max_delay(),
        }
    }

    fn request(&self, since: &Seq) -> ChangesRequest {
        ChangesRequest {
            mode: self.mode,
            since: since.clone(),
            limit: None,
            filter: self.filter.clone(),
            filter_params: self.filter_params.clone(),
            doc_ids: self.doc_ids.clone(),
            heartbeat: Some(self.heartbeat),
            timeout: (self.mode == FeedMode::LongPoll).then_some(self.request_timeout),
            all_leaves: true,
        }
    }

    fn retries_allowed(&self, attempt: u32) -> bool {
        self.continuous || self.mode.is_streaming() || self.max_retries.allows(attempt)
    }
}

/// Errors that no amount of retrying fixes: auth failures and 4xx other
/// than 404 and 409.
pub fn is_permanent(error: &TrellisError) -> bool {
    match error {
        TrellisError::Unauthorized
        | TrellisError::Forbidden(_)
        | TrellisError::BadRequest(_)
        | TrellisError::InvalidRev(_) => true,
        TrellisError::PermanentNetwork { status, .. } => {
            (400..500).contains(status) && *status != 404 && *status != 409
        }
        _ => false,
    }
}

enum SessionEnd {
    /// One-shot feed delivered everything.
    Complete,
    /// Re-open right away: long-poll answered, or the stream closed.
    Reopen,
}

pub struct ChangeTracker {
    cancel: CancellationToken,
    retry_tx: watch::Sender<u64>,
    task: JoinHandle<()>,
}

impl ChangeTracker {
    /// Start tracking. Events arrive on the returned channel, ending with
    /// `Finished`. Cancelling `cancel` (or calling `stop`) ends the feed.
    pub fn start(
        peer: Arc<dyn Peer>,
        options: TrackerOptions,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<TrackerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let (retry_tx, retry_rx) = watch::channel(0u64);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let error = run(peer, options, token, retry_rx, &tx).await;
            let _ = tx.send(TrackerEvent::Finished { error }).await;
        });
        (
            Self {
                cancel,
                retry_tx,
                task,
            },
            rx,
        )
    }

    /// Cut a pending backoff short.
    pub fn retry(&self) {
        self.retry_tx.send_modify(|n| *n += 1);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

struct Cursor {
    since: Seq,
    attempt: u32,
    caught_up: bool,
}

async fn run(
    peer: Arc<dyn Peer>,
    options: TrackerOptions,
    cancel: CancellationToken,
    mut retry_rx: watch::Receiver<u64>,
    tx: &mpsc::Sender<TrackerEvent>,
) -> Option<TrellisError> {
    let mut cursor = Cursor {
        since: options.since.clone(),
        attempt: 0,
        caught_up: false,
    };
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match follow(peer.as_ref(), &options, &cancel, tx, &mut cursor).await {
            Ok(SessionEnd::Complete) => return None,
            Ok(SessionEnd::Reopen) => continue,
            Err(TrellisError::Canceled) => return None,
            Err(e) if is_permanent(&e) => {
                warn!(error = %e, "change feed failed permanently");
                return Some(e);
            }
            Err(e) => {
                cursor.attempt += 1;
                if !options.retries_allowed(cursor.attempt) {
                    warn!(error = %e, attempts = cursor.attempt, "change feed out of retries");
                    return Some(e);
                }
                let delay = backoff_delay(
                    options.retry_initial_delay,
                    options.retry_max_delay,
                    cursor.attempt,
                );
                info!(error = %e, attempt = cursor.attempt, ?delay, "change feed retrying");
                let event = TrackerEvent::Retrying {
                    error: e,
                    attempt: cursor.attempt,
                    delay,
                };
                if tx.send(event).await.is_err() {
                    return None;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    Ok(()) = retry_rx.changed() => debug!("change feed retry requested"),
                    _ = cancel.cancelled() => return None,
                }
            }
        }
    }
}

/// Open one feed and drain it.
async fn follow(
    peer: &dyn Peer,
    options: &TrackerOptions,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<TrackerEvent>,
    cursor: &mut Cursor,
) -> Result<SessionEnd> {
    let request = options.request(&cursor.since);
    let mut stream = tokio::select! {
        stream = peer.open_changes(request) => stream?,
        _ = cancel.cancelled() => return Err(TrellisError::Canceled),
    };
    debug!(since = %cursor.since, mode = ?options.mode, "change feed opened");

    loop {
        // An idle gap longer than a heartbeat on a streamed feed means the
        // backlog is through.
        let idle_check = options.mode.is_streaming() && !cursor.caught_up;
        let event = tokio::select! {
            event = stream.next() => event,
            _ = cancel.cancelled() => return Err(TrellisError::Canceled),
            _ = tokio::time::sleep(options.heartbeat), if idle_check => {
                cursor.caught_up = true;
                send(tx, TrackerEvent::CaughtUp).await?;
                continue;
            }
        };
        match event {
            None => {
                return Ok(if options.mode == FeedMode::OneShot {
                    SessionEnd::Complete
                } else {
                    SessionEnd::Reopen
                });
            }
            Some(Err(e)) => return Err(e),
            Some(Ok(FeedEvent::Change(row))) => {
                cursor.attempt = 0;
                cursor.since = row.seq.clone();
                let rev_ids = match row.rev_ids() {
                    Ok(revs) => revs,
                    Err(e) => {
                        warn!(doc_id = %row.id, error = %e, "skipping change with bad revision");
                        continue;
                    }
                };
                send(
                    tx,
                    TrackerEvent::Received {
                        sequence: row.seq,
                        doc_id: row.id,
                        rev_ids,
                        deleted: row.deleted,
                    },
                )
                .await?;
            }
            Some(Ok(FeedEvent::LastSeq(seq))) => {
                cursor.attempt = 0;
                cursor.since = seq;
                if !cursor.caught_up {
                    cursor.caught_up = true;
                    send(tx, TrackerEvent::CaughtUp).await?;
                }
                match options.mode {
                    FeedMode::OneShot => return Ok(SessionEnd::Complete),
                    FeedMode::LongPoll => return Ok(SessionEnd::Reopen),
                    FeedMode::Continuous | FeedMode::Socket => {}
                }
            }
        }
    }
}

/// A dropped receiver ends the tracker.
async fn send(tx: &mpsc::Sender<TrackerEvent>, event: TrackerEvent) -> Result<()> {
    tx.send(event).await.map_err(|_| TrellisError::Canceled)
}
