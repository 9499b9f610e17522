/// Streaming change feed for trellis.
///
/// Wraps the page query of a database (`changes_since`) into a lazy,
/// restartable stream. In live mode, once the backlog is drained, the
/// stream parks on the database's commit notifications and re-reads the
/// change log after each one, so filters, `doc_ids` and leaf rules are
/// applied the same way for backlog and live changes.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trellis_core::error::Result;
use trellis_core::rev_id::RevId;
use trellis_store::{ChangesOptions, ChangesPage, Database, DatabaseChange, FilterSpec, RevisionChange};

/// Something that can answer change-log page queries and notify about new
/// commits.
#[async_trait]
pub trait ChangesSource: Send + Sync {
    async fn changes_page(&self, since: u64, options: &ChangesOptions) -> Result<ChangesPage>;

    /// Commit notifications, if the source has any. Without them a live
    /// stream polls.
    fn subscribe(&self) -> Option<broadcast::Receiver<DatabaseChange>>;
}

#[async_trait]
impl ChangesSource for Database {
    async fn changes_page(&self, since: u64, options: &ChangesOptions) -> Result<ChangesPage> {
        self.changes_since(since, options).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<DatabaseChange>> {
        Some(Database::subscribe(self))
    }
}

/// Configuration for a change feed.
#[derive(Debug, Clone)]
pub struct ChangesStreamOptions {
    pub since: u64,
    pub live: bool,
    pub include_docs: bool,
    /// Every leaf, not only winners.
    pub all_leaves: bool,
    pub doc_ids: Option<HashSet<String>>,
    pub filter: Option<FilterSpec>,
    /// Total number of changes to yield.
    pub limit: Option<usize>,
    /// Rows fetched per page query.
    pub page_size: usize,
    /// Polling interval in live mode when the source has no notifications.
    pub poll_interval: Duration,
    /// How long a live feed waits for a new change before finishing.
    pub timeout: Option<Duration>,
}

impl Default for ChangesStreamOptions {
    fn default() -> Self {
        Self {
            since: 0,
            live: false,
            include_docs: false,
            all_leaves: false,
            doc_ids: None,
            filter: None,
            limit: None,
            page_size: 100,
            poll_interval: Duration::from_millis(500),
            timeout: None,
        }
    }
}

/// Fetch every change after `opts.since` in one-shot mode.
pub async fn get_changes(
    source: &dyn ChangesSource,
    opts: ChangesStreamOptions,
) -> Result<Vec<RevisionChange>> {
    let mut feed = ChangeFeed::new(
        Arc::new(SourceRef(source)),
        ChangesStreamOptions { live: false, ..opts },
    );
    let mut out = Vec::new();
    while let Some(change) = feed.next_change().await? {
        out.push(change);
    }
    Ok(out)
}

/// Borrowed source, so `get_changes` does not need an `Arc`.
struct SourceRef<'a>(&'a dyn ChangesSource);

#[async_trait]
impl ChangesSource for SourceRef<'_> {
    async fn changes_page(&self, since: u64, options: &ChangesOptions) -> Result<ChangesPage> {
        self.0.changes_page(since, options).await
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<DatabaseChange>> {
        self.0.subscribe()
    }
}

enum FeedState {
    /// Fetching the first page.
    FetchingInitial,
    /// Yielding buffered results.
    Yielding,
    /// Backlog drained; waiting for a notification.
    Waiting,
    /// Limit reached, timed out, or not live.
    Done,
}

/// A lazy, restartable change feed.
///
/// Restarting is just building a new feed with `since` set to the last
/// sequence this one reported.
pub struct ChangeFeed<S: ChangesSource + ?Sized> {
    source: Arc<S>,
    receiver: Option<broadcast::Receiver<DatabaseChange>>,
    opts: ChangesStreamOptions,
    last_seq: u64,
    buffer: VecDeque<RevisionChange>,
    /// Origins of revisions seen in notifications but not yet yielded.
    sources: HashMap<(String, RevId), String>,
    /// The last page came back short: nothing more is stored right now.
    at_end: bool,
    state: FeedState,
    count: usize,
}

impl<S: ChangesSource + ?Sized> ChangeFeed<S> {
    pub fn new(source: Arc<S>, opts: ChangesStreamOptions) -> Self {
        // Subscribe before the first read so nothing committed in between
        // is missed.
        let receiver = if opts.live { source.subscribe() } else { None };
        Self {
            source,
            receiver,
            last_seq: opts.since,
            opts,
            buffer: VecDeque::new(),
            sources: HashMap::new(),
            at_end: false,
            state: FeedState::FetchingInitial,
            count: 0,
        }
    }

    /// Position to resume from: every change up to here has been yielded
    /// or filtered out.
    pub fn last_sequence(&self) -> u64 {
        self.last_seq
    }

    /// Backlog drained and nothing buffered.
    pub fn is_caught_up(&self) -> bool {
        self.buffer.is_empty() && self.at_end
    }

    async fn fetch_page(&mut self) -> Result<()> {
        let remaining = self.opts.limit.map(|l| l.saturating_sub(self.count));
        let page_size = remaining
            .map(|r| r.min(self.opts.page_size))
            .unwrap_or(self.opts.page_size)
            .max(1);
        let options = ChangesOptions {
            limit: Some(page_size),
            include_docs: self.opts.include_docs,
            all_leaves: self.opts.all_leaves,
            doc_ids: self.opts.doc_ids.clone(),
            filter: self.opts.filter.clone(),
        };
        let page = self.source.changes_page(self.last_seq, &options).await?;
        self.at_end = page.changes.len() < page_size;
        self.last_seq = self.last_seq.max(page.last_sequence);
        for mut change in page.changes {
            let key = (change.revision.doc_id.clone(), change.revision.rev_id.clone());
            change.source = self.sources.remove(&key);
            self.buffer.push_back(change);
        }
        Ok(())
    }

    fn remember(&mut self, change: DatabaseChange) {
        if let Some(source) = change.source {
            self.sources
                .insert((change.revision.doc_id, change.revision.rev_id), source);
        }
    }

    /// Block until a notification arrives or a poll interval passes.
    /// Returns false when the feed should end.
    async fn wait_for_commit(&mut self) -> bool {
        let timeout = self.opts.timeout;
        let poll = self.opts.poll_interval;
        let receiver = self.receiver.as_mut();
        let wait = async move {
            match receiver {
                Some(rx) => loop {
                    match rx.recv().await {
                        Ok(change) => return Some(Some(change)),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "change feed lagged, re-reading the log");
                            return Some(None);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                },
                None => {
                    tokio::time::sleep(poll).await;
                    Some(None)
                }
            }
        };
        let woke = match timeout {
            Some(t) => tokio::time::timeout(t, wait).await.unwrap_or(None),
            None => wait.await,
        };
        match woke {
            Some(change) => {
                if let Some(change) = change {
                    self.remember(change);
                }
                true
            }
            None => false,
        }
    }

    /// Next change, or `None` once the feed is finished.
    pub async fn next_change(&mut self) -> Result<Option<RevisionChange>> {
        loop {
            if self.opts.limit.is_some_and(|limit| self.count >= limit) {
                self.state = FeedState::Done;
            }

            match self.state {
                FeedState::FetchingInitial => {
                    self.fetch_page().await?;
                    self.state = FeedState::Yielding;
                }
                FeedState::Yielding => {
                    if let Some(change) = self.buffer.pop_front() {
                        self.count += 1;
                        return Ok(Some(change));
                    }
                    if !self.at_end {
                        self.fetch_page().await?;
                        continue;
                    }
                    self.state = if self.opts.live {
                        FeedState::Waiting
                    } else {
                        FeedState::Done
                    };
                }
                FeedState::Waiting => {
                    if !self.wait_for_commit().await {
                        self.state = FeedState::Done;
                        continue;
                    }
                    // Collect whatever else is queued before re-reading.
                    let mut pending = Vec::new();
                    if let Some(rx) = self.receiver.as_mut() {
                        while let Ok(change) = rx.try_recv() {
                            pending.push(change);
                        }
                    }
                    for change in pending {
                        self.remember(change);
                    }
                    self.fetch_page().await?;
                    self.state = FeedState::Yielding;
                }
                FeedState::Done => return Ok(None),
            }
        }
    }
}

/// Handle for a live change feed. Dropping or cancelling stops the feed.
pub struct ChangesHandle {
    cancel: CancellationToken,
}

impl ChangesHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChangesHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a live change feed that sends each change through an mpsc
/// channel. The feed ends when the handle is dropped, the receiver is
/// dropped, or the source fails.
pub fn live_changes<S: ChangesSource + ?Sized + 'static>(
    source: Arc<S>,
    opts: ChangesStreamOptions,
) -> (mpsc::Receiver<RevisionChange>, ChangesHandle) {
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    tokio::spawn(async move {
        let mut feed = ChangeFeed::new(source, ChangesStreamOptions { live: true, ..opts });
        loop {
            tokio::select! {
                change = feed.next_change() => {
                    match change {
                        Ok(Some(change)) => {
                            if tx.send(change).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "live change feed failed");
                            break;
                        }
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    });

    (rx, ChangesHandle { cancel })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
