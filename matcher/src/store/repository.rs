use async_trait::async_trait;
use std::collections::HashSet;

use crate::allocator::types::{Candidate, CandidateOrder, GroupPlan};
use crate::error::MatchError;
use crate::invoice::model::{BatchReport, BatchStatus, MatchKey};

/// How `create_batch` admitted the batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchAdmission {
    /// No prior metadata row existed.
    Fresh,
    /// A prior `failed` run was resumed; the caller must skip negatives
    /// that already have committed records.
    Resumed,
}

/// Capability boundary between the engine and the relational store.
///
/// The allocator never sees this trait; the executor drives it. An
/// in-memory implementation is enough to unit-test the whole engine
/// (see the executor's test module).
#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Ordered window of blue lines with positive balance for `key`.
    ///
    /// Every returned candidate satisfies `remaining > 0` at read time
    /// and matches `key` exactly; ordering is `order` with `line_id`
    /// ascending as tiebreak. `exclude` removes already-seen lines on
    /// refetch rounds. An empty result is not an error.
    async fn fetch_candidates(
        &self,
        key: MatchKey,
        limit: usize,
        order: CandidateOrder,
        exclude: &[i64],
    ) -> Result<Vec<Candidate>, MatchError>;

    /// Commit one group's plan atomically: re-validate and decrement each
    /// touched line (ascending `line_id`), insert the match records, then
    /// commit. A concurrently-shrunk balance fails the whole group with
    /// `MatchError::Stale` and leaves the store untouched.
    async fn apply_group(&self, batch_id: &str, plan: &GroupPlan) -> Result<(), MatchError>;

    /// Register the batch in `batch_metadata` with status `running`.
    ///
    /// An existing row is `DuplicateBatch`, unless its status is `failed`
    /// and `resume` is set, in which case the row is reopened
    /// (`resumed_at` = now, `resumed_from` = previous start time).
    async fn create_batch(
        &self,
        batch_id: &str,
        total_lines: usize,
        resume: bool,
    ) -> Result<BatchAdmission, MatchError>;

    /// Negatives of `batch_id` that already have active records; the
    /// resume path skips these.
    async fn processed_negatives(&self, batch_id: &str) -> Result<HashSet<String>, MatchError>;

    /// Close the batch's metadata row with a terminal status.
    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<String>,
    ) -> Result<(), MatchError>;

    /// Write the aggregate row to the optional reporting sink.
    async fn record_report(&self, report: &BatchReport) -> Result<(), MatchError>;
}
