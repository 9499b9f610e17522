/// Errors shared by every trellis crate.
///
/// The variants follow the failure classes a caller has to tell apart:
/// local MVCC and validation failures, caller mistakes, network failures
/// (transient or permanent) and storage failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TrellisError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("document update conflict")]
    Conflict,

    #[error("invalid document id: {0}")]
    BadId(String),

    #[error("invalid revision id: {0}")]
    InvalidRev(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("rejected by validation: {0}")]
    ValidationRejected(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("network error (HTTP {status}): {reason}")]
    PermanentNetwork { status: u16, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("operation canceled")]
    Canceled,

    #[error("json error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for TrellisError {
    fn from(e: serde_json::Error) -> Self {
        TrellisError::Json(e.to_string())
    }
}

impl TrellisError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrellisError::TransientNetwork(_))
    }

    /// Errors that end a replication immediately, with no retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TrellisError::Unauthorized
                | TrellisError::Forbidden(_)
                | TrellisError::Storage(_)
                | TrellisError::Corrupt(_)
        )
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            TrellisError::NotFound(_) => 404,
            TrellisError::Conflict => 409,
            TrellisError::BadId(_) | TrellisError::InvalidRev(_) | TrellisError::BadRequest(_) => {
                400
            }
            TrellisError::ValidationRejected(_) | TrellisError::Forbidden(_) => 403,
            TrellisError::Unauthorized => 401,
            TrellisError::TransientNetwork(_) => 503,
            TrellisError::PermanentNetwork { status, .. } => *status,
            TrellisError::Canceled => 499,
            TrellisError::Json(_) => 400,
            TrellisError::Storage(_) | TrellisError::Corrupt(_) => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
