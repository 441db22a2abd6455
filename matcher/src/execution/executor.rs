//! Batch executor for negative-invoice matching.
//!
//! Drives a whole batch: admits it against `batch_metadata`, partitions
//! the negatives into key-groups, fans the groups out to a bounded worker
//! pool, and aggregates per-group reports into a `BatchOutcome`.
//!
//! Design principles:
//! - **Groups are the isolation unit**: disjoint keys, disjoint candidate
//!   windows, no cross-group ordering promises.
//! - **All durability lives in the store**: a group either commits its
//!   whole plan via `apply_group` or leaves no trace.
//! - **Failures degrade, they don't abort**: a group that exhausts its
//!   retries reports its negatives as unmatched and the batch continues.
//!   Only duplicate admission and integrity violations are fatal.
//!
//! This module NEVER:
//! - performs balance arithmetic against the store
//! - holds locks across group boundaries
//! - re-orders results inside a group (the allocator's order is final)

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::allocator::greedy::allocate;
use crate::allocator::types::Candidate;
use crate::error::MatchError;
use crate::execution::types::{BatchOptions, BatchOutcome, CancelFlag, ExecutionMode};
use crate::grouper::{KeyGroup, group_negatives};
use crate::invoice::model::{BatchReport, BatchStatus, MatchResult, MatchStatus, NegativeInvoice};
use crate::logger::warn_if_slow;
use crate::metrics::counters::Counters;
use crate::store::repository::{BatchAdmission, MatchStore};

/// One group's processed results, flowing from a worker to the
/// aggregation loop.
struct GroupReport {
    results: Vec<MatchResult>,
    fragments: u64,
}

/// Entry point for batch matching. Cheap to clone; workers share the
/// store handle and the metrics counters.
#[derive(Clone)]
pub struct MatchEngine {
    store: Arc<dyn MatchStore>,
    counters: Counters,
}

impl MatchEngine {
    pub fn new(store: Arc<dyn MatchStore>, counters: Counters) -> Self {
        Self { store, counters }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Executes a batch and returns its outcome.
    ///
    /// If streaming mode engages (explicitly, or because the batch size
    /// reached `streaming_threshold`) without a streaming consumer, the
    /// outcome carries aggregates only; use [`MatchEngine::execute_streaming`]
    /// to consume per-negative results lazily.
    pub async fn execute(
        &self,
        negatives: Vec<NegativeInvoice>,
        opts: BatchOptions,
        cancel: CancelFlag,
    ) -> Result<BatchOutcome, MatchError> {
        self.run(negatives, opts, cancel, None).await
    }

    /// Executes a batch in streaming mode: each `MatchResult` is sent to
    /// the returned receiver as soon as its group commits. The receiver
    /// is a finite, non-restartable sequence; backpressure is the bounded
    /// channel. The final outcome (aggregates only) resolves through the
    /// join handle.
    pub fn execute_streaming(
        &self,
        negatives: Vec<NegativeInvoice>,
        mut opts: BatchOptions,
        cancel: CancelFlag,
    ) -> (
        mpsc::Receiver<MatchResult>,
        tokio::task::JoinHandle<Result<BatchOutcome, MatchError>>,
    ) {
        opts.mode = ExecutionMode::Streaming;
        let (tx, rx) = mpsc::channel(opts.worker_count.max(1) * 2);

        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run(negatives, opts, cancel, Some(tx)).await });

        (rx, handle)
    }

    async fn run(
        &self,
        negatives: Vec<NegativeInvoice>,
        mut opts: BatchOptions,
        cancel: CancelFlag,
        sink: Option<mpsc::Sender<MatchResult>>,
    ) -> Result<BatchOutcome, MatchError> {
        let started = Instant::now();

        validate_input(&negatives)?;
        opts.worker_count = opts.worker_count.max(1);

        if negatives.is_empty() {
            debug!("empty batch; nothing to do");
            return Ok(BatchOutcome {
                batch_id: opts.batch_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                status: BatchStatus::Completed,
                results: Vec::new(),
                success_count: 0,
                partial_count: 0,
                failed_count: 0,
                matched_amount: 0,
                fragment_created: 0,
                execution_time_ms: started.elapsed().as_millis() as u64,
            });
        }

        let batch_id = opts
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let admission = self
            .store
            .create_batch(&batch_id, negatives.len(), opts.resume)
            .await?;

        let mut negatives = negatives;
        if admission == BatchAdmission::Resumed {
            let done = self.store.processed_negatives(&batch_id).await?;
            let before = negatives.len();
            negatives.retain(|n| !done.contains(&n.negative_invoice_id));
            info!(
                batch_id = %batch_id,
                skipped = before - negatives.len(),
                remaining = negatives.len(),
                "resuming previously failed batch"
            );
        }

        let total_negatives = negatives.len() as u64;
        let total_amount: i64 = negatives.iter().map(|n| n.amount).sum();
        let streaming = sink.is_some()
            || opts.mode == ExecutionMode::Streaming
            || negatives.len() >= opts.streaming_threshold;

        let groups = Arc::new(group_negatives(negatives, opts.sort_strategy));
        info!(
            batch_id = %batch_id,
            groups = groups.len(),
            total_negatives,
            streaming,
            worker_count = opts.worker_count,
            "batch admitted"
        );

        let deadline = opts
            .batch_timeout_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

        let opts = Arc::new(opts);
        let cursor = Arc::new(AtomicUsize::new(0));
        let (report_tx, mut report_rx) = mpsc::channel::<GroupReport>(opts.worker_count * 2);

        let mut workers: JoinSet<Result<(), MatchError>> = JoinSet::new();
        for _ in 0..opts.worker_count {
            let worker = GroupWorker {
                store: self.store.clone(),
                opts: opts.clone(),
                counters: self.counters.clone(),
                cancel: cancel.clone(),
                deadline,
                batch_id: batch_id.clone(),
            };
            let groups = groups.clone();
            let cursor = cursor.clone();
            let tx = report_tx.clone();
            workers.spawn(async move { worker.run(groups, cursor, tx).await });
        }
        drop(report_tx);

        let mut results: Vec<MatchResult> = Vec::new();
        let mut success_count = 0u64;
        let mut partial_count = 0u64;
        let mut failed_count = 0u64;
        let mut matched_amount = 0i64;
        let mut fragment_created = 0u64;
        let mut groups_reported = 0usize;
        let mut sink_open = sink.is_some();

        while let Some(report) = report_rx.recv().await {
            groups_reported += 1;
            fragment_created += report.fragments;

            for r in report.results {
                match r.status {
                    MatchStatus::Matched => success_count += 1,
                    MatchStatus::Partial => partial_count += 1,
                    MatchStatus::Unmatched => failed_count += 1,
                }
                matched_amount += r.total_allocated;

                if streaming {
                    if sink_open {
                        if let Some(tx) = sink.as_ref() {
                            if tx.send(r).await.is_err() {
                                sink_open = false;
                                warn!("result receiver dropped; remaining results not forwarded");
                            }
                        }
                    }
                } else {
                    results.push(r);
                }
            }
        }

        let mut fatal: Option<MatchError> = None;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    fatal.get_or_insert(e);
                }
                Err(e) => {
                    fatal.get_or_insert(MatchError::Integrity(format!("worker panicked: {e}")));
                }
            }
        }

        if let Some(e) = fatal {
            self.store
                .finish_batch(&batch_id, BatchStatus::Failed, Some(e.to_string()))
                .await?;
            return Err(e);
        }

        let status = if groups_reported == groups.len() {
            BatchStatus::Completed
        } else {
            // Cancellation or the batch deadline stopped workers before
            // every group was claimed.
            BatchStatus::Cancelled
        };

        self.store.finish_batch(&batch_id, status, None).await?;

        let execution_time_ms = started.elapsed().as_millis() as u64;
        self.store
            .record_report(&BatchReport {
                batch_id: batch_id.clone(),
                total_negatives,
                success_count,
                failed_count: partial_count + failed_count,
                total_amount,
                matched_amount,
                execution_time_ms,
                fragment_created,
            })
            .await?;

        info!(
            batch_id = %batch_id,
            status = status.as_str(),
            success_count,
            partial_count,
            failed_count,
            matched_amount,
            fragment_created,
            execution_time_ms,
            "batch finished"
        );

        Ok(BatchOutcome {
            batch_id,
            status,
            results,
            success_count,
            partial_count,
            failed_count,
            matched_amount,
            fragment_created,
            execution_time_ms,
        })
    }
}

/// Rejects inputs the engine must not silently absorb: non-positive
/// magnitudes and duplicate identities.
fn validate_input(negatives: &[NegativeInvoice]) -> Result<(), MatchError> {
    let mut seen: HashSet<&str> = HashSet::with_capacity(negatives.len());
    for n in negatives {
        if n.amount <= 0 {
            return Err(MatchError::InvalidInput(format!(
                "non-positive magnitude for negative {}",
                n.negative_invoice_id
            )));
        }
        if !seen.insert(n.negative_invoice_id.as_str()) {
            return Err(MatchError::InvalidInput(format!(
                "duplicate negative_invoice_id {}",
                n.negative_invoice_id
            )));
        }
    }
    Ok(())
}

/// Processes groups sequentially; one of `worker_count` identical tasks
/// pulling from the shared cursor over the pre-sorted group list.
struct GroupWorker {
    store: Arc<dyn MatchStore>,
    opts: Arc<BatchOptions>,
    counters: Counters,
    cancel: CancelFlag,
    deadline: Option<tokio::time::Instant>,
    batch_id: String,
}

impl GroupWorker {
    async fn run(
        self,
        groups: Arc<Vec<KeyGroup>>,
        cursor: Arc<AtomicUsize>,
        report_tx: mpsc::Sender<GroupReport>,
    ) -> Result<(), MatchError> {
        loop {
            if self.cancel.is_cancelled() {
                debug!("cancellation observed; worker stops claiming groups");
                break;
            }
            if self.deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                warn!("batch deadline reached; worker stops claiming groups");
                break;
            }

            let idx = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(group) = groups.get(idx) else { break };

            let span = info_span!(
                "group_match",
                batch_id = %self.batch_id,
                tax_rate = group.key.tax_rate,
                buyer_id = group.key.buyer_id,
                seller_id = group.key.seller_id,
                negatives = group.negatives.len()
            );

            let report = self.process_group(group).instrument(span).await?;
            if report_tx.send(report).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    /// Runs one group to a terminal report, absorbing retryable failures.
    ///
    /// Returns `Err` only for fatal conditions (integrity violations),
    /// which also raise the cancel flag so sibling workers stop claiming.
    async fn process_group(&self, group: &KeyGroup) -> Result<GroupReport, MatchError> {
        let group_timeout = Duration::from_millis(self.opts.group_timeout_ms.max(1));
        let mut stale_attempts = 0u32;
        let mut transport_attempts = 0u32;

        loop {
            match tokio::time::timeout(group_timeout, self.attempt_group(group)).await {
                Err(_) => {
                    self.counters
                        .group_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    let err = MatchError::Timeout { scope: "group" };
                    warn!(
                        timeout_ms = self.opts.group_timeout_ms,
                        error = %err,
                        "group deadline exceeded; rolling back"
                    );
                    return Ok(self.fail_report(group, err.failure_class()));
                }
                Ok(Ok(report)) => return Ok(report),
                Ok(Err(e @ MatchError::Stale { .. })) => {
                    self.counters.stale_retries.fetch_add(1, Ordering::Relaxed);
                    stale_attempts += 1;
                    warn!(
                        error = %e,
                        attempt = stale_attempts,
                        "allocation plan went stale; restarting group with fresh candidates"
                    );
                    if stale_attempts > self.opts.max_stale_retries {
                        self.counters
                            .contention_failures
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(self.fail_report(group, e.failure_class()));
                    }
                }
                Ok(Err(e @ MatchError::CandidateFetch(_))) => {
                    warn!(error = %e, "candidate fetch exhausted retries; failing group");
                    return Ok(self.fail_report(group, e.failure_class()));
                }
                Ok(Err(e @ MatchError::Store(_))) => {
                    transport_attempts += 1;
                    if transport_attempts > self.opts.candidate_fetch_retries {
                        warn!(error = %e, "store unavailable during commit; failing group");
                        return Ok(self.fail_report(group, e.failure_class()));
                    }
                    self.backoff(transport_attempts).await;
                }
                Ok(Err(MatchError::Integrity(msg))) => {
                    self.cancel.cancel();
                    return Err(MatchError::Integrity(msg));
                }
                Ok(Err(other)) => return Err(other),
            }
        }
    }

    /// One fetch -> allocate -> commit pass. Any error leaves the store
    /// untouched (the coordinator's transaction rolls back on drop).
    async fn attempt_group(&self, group: &KeyGroup) -> Result<GroupReport, MatchError> {
        let limit = self.opts.candidate_limit_per_group.max(1);

        // Accumulate the candidate window. A full window that still
        // cannot cover the group's demand earns follow-up fetches with
        // the lines already seen excluded, bounding worst-case
        // materialization at (max_refetch_rounds + 1) * limit rows.
        let fetch_started = Instant::now();
        let mut candidates: Vec<Candidate> = Vec::new();
        let mut exclude: Vec<i64> = Vec::new();
        let mut rounds = 0u32;
        loop {
            let window = self.fetch_window(group, limit, &exclude).await?;
            let window_full = window.len() == limit;
            exclude.extend(window.iter().map(|c| c.line_id));
            candidates.extend(window);

            let supply: i64 = candidates.iter().map(|c| c.remaining).sum();
            if supply >= group.total_amount || !window_full || rounds >= self.opts.max_refetch_rounds
            {
                break;
            }
            rounds += 1;
            self.counters.refetch_rounds.fetch_add(1, Ordering::Relaxed);
            debug!(
                round = rounds,
                supply,
                demand = group.total_amount,
                "window under demand; fetching more candidates"
            );
        }
        self.counters
            .fetch_micros
            .fetch_add(fetch_started.elapsed().as_micros() as u64, Ordering::Relaxed);

        let alloc_started = Instant::now();
        let out = allocate(
            &group.negatives,
            &candidates,
            self.opts.sort_strategy,
            self.opts.fragment_threshold,
        );
        self.counters
            .allocate_micros
            .fetch_add(alloc_started.elapsed().as_micros() as u64, Ordering::Relaxed);

        if !out.plan.is_empty() {
            let commit_started = Instant::now();
            warn_if_slow(
                "apply_group",
                Duration::from_millis(500),
                self.store.apply_group(&self.batch_id, &out.plan),
            )
            .await?;
            self.counters
                .commit_micros
                .fetch_add(commit_started.elapsed().as_micros() as u64, Ordering::Relaxed);
        }

        for r in &out.results {
            let counter = match r.status {
                MatchStatus::Matched => &self.counters.matched,
                MatchStatus::Partial => &self.counters.partial,
                MatchStatus::Unmatched => &self.counters.unmatched,
            };
            counter.fetch_add(1, Ordering::Relaxed);
        }
        self.counters
            .fragments_created
            .fetch_add(out.fragments_created, Ordering::Relaxed);
        self.counters.groups_processed.fetch_add(1, Ordering::Relaxed);

        Ok(GroupReport {
            results: out.results,
            fragments: out.fragments_created,
        })
    }

    async fn fetch_window(
        &self,
        group: &KeyGroup,
        limit: usize,
        exclude: &[i64],
    ) -> Result<Vec<Candidate>, MatchError> {
        let mut attempt = 0u32;
        loop {
            let fetched = warn_if_slow(
                "fetch_candidates",
                Duration::from_millis(200),
                self.store
                    .fetch_candidates(group.key, limit, self.opts.candidate_order, exclude),
            )
            .await;

            match fetched {
                Ok(window) => return Ok(window),
                Err(MatchError::CandidateFetch(msg)) => {
                    attempt += 1;
                    if attempt > self.opts.candidate_fetch_retries {
                        return Err(MatchError::CandidateFetch(msg));
                    }
                    self.counters.fetch_retries.fetch_add(1, Ordering::Relaxed);
                    debug!(attempt, error = %msg, "candidate fetch failed; backing off");
                    self.backoff(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn backoff(&self, attempt: u32) {
        let delay = self.opts.retry_backoff_ms.saturating_mul(attempt as u64);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    fn fail_report(&self, group: &KeyGroup, reason: &str) -> GroupReport {
        self.counters
            .unmatched
            .fetch_add(group.negatives.len() as u64, Ordering::Relaxed);
        self.counters.groups_processed.fetch_add(1, Ordering::Relaxed);

        GroupReport {
            results: group
                .negatives
                .iter()
                .map(|n| {
                    MatchResult::unmatched(
                        n.negative_invoice_id.clone(),
                        n.amount,
                        Some(reason.to_string()),
                    )
                })
                .collect(),
            fragments: 0,
        }
    }
}
