use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::allocator::types::{CandidateOrder, NegativeOrder};
use crate::invoice::model::{BatchStatus, MatchResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Groups run in parallel; per-group results accumulate in memory
    /// and return inside the `BatchOutcome`.
    #[default]
    Standard,
    /// Results are forwarded to the caller as each group commits; the
    /// outcome carries aggregates only. Selected automatically once the
    /// batch size reaches `streaming_threshold`.
    Streaming,
}

/// Per-batch execution knobs. All fields have working defaults, so a
/// JSON override (see `EngineConfig::from_env`) or a caller can set only
/// what it cares about.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub mode: ExecutionMode,
    /// Batch size at which execution switches to streaming on its own.
    pub streaming_threshold: usize,
    pub worker_count: usize,
    /// Soft cap per candidate fetch; refetch rounds may extend it.
    pub candidate_limit_per_group: usize,
    pub sort_strategy: NegativeOrder,
    pub candidate_order: CandidateOrder,
    pub max_stale_retries: u32,
    pub max_refetch_rounds: u32,
    pub candidate_fetch_retries: u32,
    pub retry_backoff_ms: u64,
    pub group_timeout_ms: u64,
    pub batch_timeout_ms: Option<u64>,
    /// Balances left strictly between zero and this many cents count as
    /// fragments.
    pub fragment_threshold: i64,
    /// Caller-supplied batch identity; generated when absent.
    pub batch_id: Option<String>,
    /// Re-admit a previously failed run of the same `batch_id`,
    /// processing only negatives without committed records.
    pub resume: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Standard,
            streaming_threshold: 10_000,
            worker_count: 4,
            candidate_limit_per_group: 500,
            sort_strategy: NegativeOrder::AmountDesc,
            candidate_order: CandidateOrder::RemainingDesc,
            max_stale_retries: 3,
            max_refetch_rounds: 2,
            candidate_fetch_retries: 3,
            retry_backoff_ms: 50,
            group_timeout_ms: 30_000,
            batch_timeout_ms: None,
            fragment_threshold: 100,
            batch_id: None,
            resume: false,
        }
    }
}

/// Cooperative cancellation signal. Workers observe it before claiming a
/// group; in-flight groups finish committing to preserve atomicity.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Batch-level return value. In streaming mode `results` is empty; the
/// per-negative stream was already consumed by the caller.
#[derive(Clone, Debug, Serialize)]
pub struct BatchOutcome {
    pub batch_id: String,
    pub status: BatchStatus,
    pub results: Vec<MatchResult>,
    pub success_count: u64,
    pub partial_count: u64,
    pub failed_count: u64,
    pub matched_amount: i64,
    pub fragment_created: u64,
    pub execution_time_ms: u64,
}
