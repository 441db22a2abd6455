use std::sync::Arc;
use std::sync::atomic::AtomicU64;

/// Shared counters for operational visibility. Atomic accumulation is the
/// only cross-worker mutable state besides the connection pool; none of
/// these affect behavior.
#[derive(Clone, Default)]
pub struct Counters {
    pub groups_processed: Arc<AtomicU64>,

    // result classes
    pub matched: Arc<AtomicU64>,
    pub partial: Arc<AtomicU64>,
    pub unmatched: Arc<AtomicU64>,
    pub fragments_created: Arc<AtomicU64>,

    // failure / retry classes
    pub stale_retries: Arc<AtomicU64>,
    pub contention_failures: Arc<AtomicU64>,
    pub fetch_retries: Arc<AtomicU64>,
    pub refetch_rounds: Arc<AtomicU64>,
    pub group_timeouts: Arc<AtomicU64>,

    // per-phase wall time, accumulated micros
    pub fetch_micros: Arc<AtomicU64>,
    pub allocate_micros: Arc<AtomicU64>,
    pub commit_micros: Arc<AtomicU64>,
}
