use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use trellis_core::document::FeedMode;
use trellis_core::error::{Result, TrellisError};
use trellis_core::peer::Credentials;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

/// Retry budget: a count, or `"unlimited"` in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "MaxRetriesRepr", into = "MaxRetriesRepr")]
pub enum MaxRetries {
    Limited(u32),
    Unlimited,
}

impl MaxRetries {
    pub fn limit(self) -> Option<u32> {
        match self {
            MaxRetries::Limited(n) => Some(n),
            MaxRetries::Unlimited => None,
        }
    }

    /// Whether attempt number `attempt` (1-based) may still run.
    pub fn allows(self, attempt: u32) -> bool {
        self.limit().is_none_or(|n| attempt <= n)
    }
}

impl Default for MaxRetries {
    fn default() -> Self {
        MaxRetries::Limited(10)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MaxRetriesRepr {
    Count(u32),
    Word(String),
}

impl TryFrom<MaxRetriesRepr> for MaxRetries {
    type Error = String;

    fn try_from(repr: MaxRetriesRepr) -> std::result::Result<Self, String> {
        match repr {
            MaxRetriesRepr::Count(n) => Ok(MaxRetries::Limited(n)),
            MaxRetriesRepr::Word(w) if w == "unlimited" => Ok(MaxRetries::Unlimited),
            MaxRetriesRepr::Word(w) => Err(format!("invalid maxRetries: {w}")),
        }
    }
}

impl From<MaxRetries> for MaxRetriesRepr {
    fn from(m: MaxRetries) -> Self {
        match m {
            MaxRetries::Limited(n) => MaxRetriesRepr::Count(n),
            MaxRetries::Unlimited => MaxRetriesRepr::Word("unlimited".into()),
        }
    }
}

/// Which kinds of network a replication may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    #[default]
    Any,
    WifiOnly,
    CellOnly,
}

/// Reachability as reported by the host through `Replicator::set_network`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkStatus {
    Unreachable,
    Wifi,
    Cell,
    /// Reachable over something else (ethernet, loopback).
    #[default]
    Other,
}

impl NetworkPolicy {
    pub fn allows(self, status: NetworkStatus) -> bool {
        match (self, status) {
            (_, NetworkStatus::Unreachable) => false,
            (NetworkPolicy::Any, _) => true,
            (NetworkPolicy::WifiOnly, NetworkStatus::Cell) => false,
            (NetworkPolicy::WifiOnly, _) => true,
            (NetworkPolicy::CellOnly, NetworkStatus::Cell) => true,
            (NetworkPolicy::CellOnly, _) => false,
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    60_000
}
fn default_heartbeat_ms() -> u64 {
    30_000
}
fn default_batch_size() -> usize {
    100
}
fn default_max_in_flight() -> usize {
    4
}
fn default_insert_batch_size() -> usize {
    100
}
fn default_insert_batch_delay_ms() -> u64 {
    250
}
fn default_retry_initial_delay_ms() -> u64 {
    2_000
}
fn default_retry_max_delay_ms() -> u64 {
    300_000
}
fn default_true() -> bool {
    true
}

/// Everything that configures one replication. Immutable once the
/// replicator starts.
///
/// Deserializes from camelCase JSON; only `remote` and `direction` are
/// required:
///
/// ```json
/// {"remote": "http://localhost:5984/db", "direction": "pull",
///  "continuous": true, "maxRetries": "unlimited",
///  "auth": {"basic": {"username": "u", "password": "p"}}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSettings {
    /// URL of the remote database, or a local path.
    pub remote: String,
    pub direction: Direction,
    #[serde(default)]
    pub continuous: bool,
    /// Pushes use a filter registered on the local database; pulls pass
    /// the name to the remote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_name: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub filter_params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_ids: Option<Vec<String>>,
    #[serde(default)]
    pub create_target: bool,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default)]
    pub max_retries: MaxRetries,
    #[serde(default)]
    pub network: NetworkPolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Credentials>,
    /// Changes per revs_diff / upload round trip.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_batches: usize,
    /// Fetched revisions per insert transaction on pull.
    #[serde(default = "default_insert_batch_size")]
    pub insert_batch_size: usize,
    #[serde(default = "default_insert_batch_delay_ms")]
    pub insert_batch_delay_ms: u64,
    /// Remote feed mode for pulls. Defaults to one-shot, or long-poll when
    /// continuous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_mode: Option<FeedMode>,
    /// Forget the checkpoint and start over.
    #[serde(default)]
    pub reset: bool,
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Mirror the checkpoint to the remote as `_local/<id>`.
    #[serde(default = "default_true")]
    pub remote_checkpoint: bool,
}

impl ReplicationSettings {
    pub fn new(remote: impl Into<String>, direction: Direction) -> Self {
        Self {
            remote: remote.into(),
            direction,
            continuous: false,
            filter_name: None,
            filter_params: Map::new(),
            doc_ids: None,
            create_target: false,
            request_timeout_ms: default_request_timeout_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            max_retries: MaxRetries::default(),
            network: NetworkPolicy::default(),
            headers: BTreeMap::new(),
            auth: None,
            batch_size: default_batch_size(),
            max_in_flight_batches: default_max_in_flight(),
            insert_batch_size: default_insert_batch_size(),
            insert_batch_delay_ms: default_insert_batch_delay_ms(),
            tracker_mode: None,
            reset: false,
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            remote_checkpoint: true,
        }
    }

    pub fn push(remote: impl Into<String>) -> Self {
        Self::new(remote, Direction::Push)
    }

    pub fn pull(remote: impl Into<String>) -> Self {
        Self::new(remote, Direction::Pull)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.trim().is_empty() {
            return Err(TrellisError::BadRequest("remote is required".into()));
        }
        if self.batch_size == 0 || self.insert_batch_size == 0 || self.max_in_flight_batches == 0
        {
            return Err(TrellisError::BadRequest(
                "batchSize, insertBatchSize and maxInFlightBatches must be positive".into(),
            ));
        }
        if self.filter_name.is_some() && self.doc_ids.is_some() {
            return Err(TrellisError::BadRequest(
                "filterName and docIds cannot be combined".into(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn insert_batch_delay(&self) -> Duration {
        Duration::from_millis(self.insert_batch_delay_ms)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    pub fn feed_mode(&self) -> FeedMode {
        match (self.tracker_mode, self.continuous) {
            (Some(mode), _) => mode,
            (None, true) => FeedMode::LongPoll,
            (None, false) => FeedMode::OneShot,
        }
    }

    /// Retry budget for permanent HTTP failures.
    pub(crate) fn permanent_retry_limit(&self) -> u32 {
        self.max_retries.limit().unwrap_or(3)
    }
}

/// Delay before retry number `attempt` (1-based): `initial` doubling up to
/// `max`.
pub fn backoff_delay(initial: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}
