use thiserror::Error;

/// Engine error taxonomy.
///
/// Per-group failures (`CandidateFetch`, `Stale`, `Timeout`, `Store`) never
/// abort the batch; once the configured retries are spent they degrade into
/// per-negative result classifications via [`MatchError::failure_class`].
/// `DuplicateBatch`, `Integrity` and invalid input are fatal. Cancellation
/// is not an error at all: it surfaces as a partial outcome with batch
/// status `cancelled`.
#[derive(Error, Debug)]
pub enum MatchError {
    #[error("candidate fetch failed: {0}")]
    CandidateFetch(String),

    #[error("allocation plan went stale on line {line_id}")]
    Stale { line_id: i64 },

    #[error("batch {0} already exists and is not resumable")]
    DuplicateBatch(String),

    #[error("{scope} deadline exceeded")]
    Timeout { scope: &'static str },

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl MatchError {
    /// Stable lower-snake class recorded on a group's negatives when this
    /// error exhausts the group's retries.
    pub fn failure_class(&self) -> &'static str {
        match self {
            MatchError::CandidateFetch(_) => "candidate_fetch_failed",
            MatchError::Stale { .. } => "contention_exceeded",
            MatchError::DuplicateBatch(_) => "duplicate_batch",
            MatchError::Timeout { .. } => "timeout_exceeded",
            MatchError::Integrity(_) => "integrity_violation",
            MatchError::InvalidInput(_) => "invalid_input",
            MatchError::Store(_) => "storage_error",
        }
    }
}
