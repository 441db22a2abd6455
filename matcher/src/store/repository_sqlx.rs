use async_trait::async_trait;
use sqlx::{AnyPool, Row};
use std::collections::HashSet;
use uuid::Uuid;

use crate::allocator::types::{Candidate, CandidateOrder, GroupPlan};
use crate::error::MatchError;
use crate::invoice::model::{BatchReport, BatchStatus, BlueLine, MatchKey};
use crate::store::repository::{BatchAdmission, MatchStore};
use crate::time::now_ms;

/// SQLx-backed implementation of MatchStore.
/// Responsible only for persistence, the commit protocol, and row mapping.
pub struct SqlxMatchStore {
    pool: AnyPool,
}

impl SqlxMatchStore {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Full-row read of one blue line, for diagnostics and invariant
    /// checks. Reads outside a group's commit path tolerate eventual
    /// visibility.
    pub async fn load_line(&self, line_id: i64) -> Result<Option<BlueLine>, MatchError> {
        let row = sqlx::query("SELECT * FROM blue_lines WHERE line_id = ?")
            .bind(line_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_blue_line(&r)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl MatchStore for SqlxMatchStore {
    async fn fetch_candidates(
        &self,
        key: MatchKey,
        limit: usize,
        order: CandidateOrder,
        exclude: &[i64],
    ) -> Result<Vec<Candidate>, MatchError> {
        // Selection is served by the compound partial index on
        // (tax_rate, buyer_id, seller_id) WHERE remaining > 0; the
        // remaining-extended variant covers the sorted scans.
        let mut sql = String::from(
            "SELECT line_id, remaining FROM blue_lines \
             WHERE tax_rate = ? AND buyer_id = ? AND seller_id = ? AND remaining > 0",
        );

        if !exclude.is_empty() {
            sql.push_str(" AND line_id NOT IN (");
            sql.push_str(&vec!["?"; exclude.len()].join(", "));
            sql.push(')');
        }

        sql.push_str(match order {
            CandidateOrder::RemainingAsc => " ORDER BY remaining ASC, line_id ASC",
            CandidateOrder::RemainingDesc => " ORDER BY remaining DESC, line_id ASC",
            CandidateOrder::LineIdAsc => " ORDER BY line_id ASC",
        });
        sql.push_str(" LIMIT ?");

        let mut query = sqlx::query(&sql)
            .bind(key.tax_rate as i32)
            .bind(key.buyer_id)
            .bind(key.seller_id);
        for line_id in exclude {
            query = query.bind(*line_id);
        }
        query = query.bind(limit as i64);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MatchError::CandidateFetch(e.to_string()))?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(Candidate {
                line_id: r.try_get("line_id").map_err(MatchError::Store)?,
                remaining: cents_from_db(r.try_get::<f64, _>("remaining").map_err(MatchError::Store)?)?,
            });
        }
        Ok(out)
    }

    async fn apply_group(&self, batch_id: &str, plan: &GroupPlan) -> Result<(), MatchError> {
        if plan.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let now = now_ms();

        // Decrements arrive in ascending line_id order; updating in that
        // order acquires row locks in a deadlock-free sequence.
        for d in &plan.decrements {
            let row = sqlx::query("SELECT remaining FROM blue_lines WHERE line_id = ?")
                .bind(d.line_id)
                .fetch_optional(&mut *tx)
                .await?;

            let Some(row) = row else {
                return Err(MatchError::Stale { line_id: d.line_id });
            };

            let raw: f64 = row.try_get("remaining").map_err(MatchError::Store)?;
            let current = cents_from_db(raw)?;
            if current < d.amount {
                // Another worker consumed this balance since the fetch;
                // the dropped transaction rolls back.
                return Err(MatchError::Stale { line_id: d.line_id });
            }

            // Compare-and-set against the exact stored value. The new
            // balance is computed in Rust; the store does no arithmetic.
            let res = sqlx::query(
                "UPDATE blue_lines SET remaining = ?, last_update = ? \
                 WHERE line_id = ? AND remaining = ?",
            )
            .bind(cents_to_db(current - d.amount))
            .bind(now)
            .bind(d.line_id)
            .bind(raw)
            .execute(&mut *tx)
            .await?;

            if res.rows_affected() != 1 {
                return Err(MatchError::Stale { line_id: d.line_id });
            }
        }

        for a in &plan.allocations {
            let res = sqlx::query(
                "INSERT INTO match_records \
                 (match_id, batch_id, negative_invoice_id, blue_line_id, amount_used, match_time, status) \
                 VALUES (?, ?, ?, ?, ?, ?, 'active')",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(batch_id)
            .bind(&a.negative_invoice_id)
            .bind(a.blue_line_id)
            .bind(cents_to_db(a.amount_used))
            .bind(now)
            .execute(&mut *tx)
            .await;

            if let Err(e) = res {
                if is_unique_violation(&e) {
                    // Bug signal: the plan tried to record the same
                    // (batch, negative, line) twice. Log it for forensics.
                    tracing::error!(
                        batch_id,
                        negative_invoice_id = %a.negative_invoice_id,
                        blue_line_id = a.blue_line_id,
                        amount_used = a.amount_used,
                        plan = ?plan.decrements,
                        "duplicate match record rejected by store"
                    );
                    return Err(MatchError::Integrity(format!(
                        "duplicate match record for negative {} on line {}",
                        a.negative_invoice_id, a.blue_line_id
                    )));
                }
                return Err(e.into());
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_batch(
        &self,
        batch_id: &str,
        total_lines: usize,
        resume: bool,
    ) -> Result<BatchAdmission, MatchError> {
        let existing = sqlx::query("SELECT status, start_time FROM batch_metadata WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = existing {
            let status: String = row.try_get("status").map_err(MatchError::Store)?;
            if status != BatchStatus::Failed.as_str() || !resume {
                return Err(MatchError::DuplicateBatch(batch_id.to_string()));
            }

            let start_time: i64 = row.try_get("start_time").map_err(MatchError::Store)?;
            sqlx::query(
                "UPDATE batch_metadata \
                 SET status = 'running', resumed_at = ?, resumed_from = ?, \
                     end_time = NULL, error_message = NULL \
                 WHERE batch_id = ?",
            )
            .bind(now_ms())
            .bind(start_time)
            .bind(batch_id)
            .execute(&self.pool)
            .await?;

            return Ok(BatchAdmission::Resumed);
        }

        let res = sqlx::query(
            "INSERT INTO batch_metadata \
             (batch_id, table_name, total_lines, inserted_lines, status, start_time) \
             VALUES (?, 'blue_lines', ?, 0, 'running', ?)",
        )
        .bind(batch_id)
        .bind(total_lines as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(BatchAdmission::Fresh),
            // Lost the insert race to a concurrent run of the same id.
            Err(e) if is_unique_violation(&e) => {
                Err(MatchError::DuplicateBatch(batch_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn processed_negatives(&self, batch_id: &str) -> Result<HashSet<String>, MatchError> {
        let rows = sqlx::query(
            "SELECT DISTINCT negative_invoice_id FROM match_records \
             WHERE batch_id = ? AND status = 'active'",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashSet::with_capacity(rows.len());
        for r in rows {
            out.insert(
                r.try_get::<String, _>("negative_invoice_id")
                    .map_err(MatchError::Store)?,
            );
        }
        Ok(out)
    }

    async fn finish_batch(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: Option<String>,
    ) -> Result<(), MatchError> {
        sqlx::query(
            "UPDATE batch_metadata SET status = ?, end_time = ?, error_message = ? \
             WHERE batch_id = ?",
        )
        .bind(status.as_str())
        .bind(now_ms())
        .bind(error)
        .bind(batch_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_report(&self, report: &BatchReport) -> Result<(), MatchError> {
        sqlx::query(
            "INSERT INTO test_results \
             (test_id, batch_id, total_negatives, success_count, failed_count, \
              total_amount, matched_amount, execution_time_ms, fragment_created, test_time) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&report.batch_id)
        .bind(report.total_negatives as i64)
        .bind(report.success_count as i64)
        .bind(report.failed_count as i64)
        .bind(cents_to_db(report.total_amount))
        .bind(cents_to_db(report.matched_amount))
        .bind(report.execution_time_ms as i64)
        .bind(report.fragment_created as i64)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

/* =========================
Row mapping
========================= */

fn row_to_blue_line(r: &sqlx::any::AnyRow) -> Result<BlueLine, MatchError> {
    let get_str = |col: &str| r.try_get::<String, _>(col).map_err(MatchError::Store);

    Ok(BlueLine {
        line_id: r.try_get("line_id").map_err(MatchError::Store)?,
        ticket_id: get_str("ticket_id")?,
        key: MatchKey {
            tax_rate: r.try_get::<i32, _>("tax_rate").map_err(MatchError::Store)? as i16,
            buyer_id: r.try_get("buyer_id").map_err(MatchError::Store)?,
            seller_id: r.try_get("seller_id").map_err(MatchError::Store)?,
        },
        product_name: get_str("product_name")?,
        original_amount: cents_from_db(
            r.try_get::<f64, _>("original_amount").map_err(MatchError::Store)?,
        )?,
        remaining: cents_from_db(r.try_get::<f64, _>("remaining").map_err(MatchError::Store)?)?,
        batch_id: r.try_get("batch_id").ok(),
        create_time: r.try_get("create_time").map_err(MatchError::Store)?,
        last_update: r.try_get("last_update").map_err(MatchError::Store)?,
    })
}

/* =========================
Fixed-point conversions
========================= */

// Balances are i64 cents in Rust and DECIMAL(15,2) in the store. A
// DECIMAL(15,2) value has at most 15 significant digits, so the f64
// round-trip below is exact for every representable balance.

/// Largest magnitude DECIMAL(15,2) can hold, in cents.
const MAX_DB_CENTS: f64 = 1e15;

pub(crate) fn cents_from_db(v: f64) -> Result<i64, MatchError> {
    let scaled = (v * 100.0).round();
    if !scaled.is_finite() || scaled.abs() >= MAX_DB_CENTS {
        return Err(MatchError::Integrity(format!(
            "amount out of DECIMAL(15,2) range: {v}"
        )));
    }
    Ok(scaled as i64)
}

pub(crate) fn cents_to_db(cents: i64) -> f64 {
    cents as f64 / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cents_round_trip_is_exact() {
        for cents in [0i64, 1, 99, 100, 12_345, 999_999_999, -250] {
            assert_eq!(cents_from_db(cents_to_db(cents)).unwrap(), cents);
        }
    }

    #[test]
    fn cents_round_trip_is_exact_at_scale_boundaries() {
        // 13 digits of cents is the DECIMAL(15,2) ceiling.
        let max_representable = 9_999_999_999_999_99i64;
        assert_eq!(
            cents_from_db(cents_to_db(max_representable)).unwrap(),
            max_representable
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(cents_from_db(f64::NAN).is_err());
        assert!(cents_from_db(f64::INFINITY).is_err());
        assert!(cents_from_db(1e16).is_err());
    }

    #[test]
    fn fractional_noise_rounds_to_nearest_cent() {
        // Values read back from the store may carry float representation
        // noise well below cent granularity.
        assert_eq!(cents_from_db(123.450_000_000_000_01).unwrap(), 12_345);
        assert_eq!(cents_from_db(123.449_999_999_999_99).unwrap(), 12_345);
    }
}
