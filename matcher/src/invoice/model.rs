use serde::{Deserialize, Serialize};

/// The compound key that partitions blue lines and negatives into
/// independent matching units. Two concurrent groups never share a key,
/// so their candidate windows are disjoint on `line_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    /// Integer-scaled tax rate (13 = 13%).
    pub tax_rate: i16,
    pub buyer_id: i32,
    pub seller_id: i32,
}

impl MatchKey {
    pub fn new(tax_rate: i16, buyer_id: i32, seller_id: i32) -> Self {
        Self {
            tax_rate,
            buyer_id,
            seller_id,
        }
    }
}

/// An outstanding positive invoice line with unconsumed value.
///
/// Inserted by an upstream ingester; the engine only ever decrements
/// `remaining` (never deletes). All monetary fields are integer cents.
#[derive(Clone, Debug)]
pub struct BlueLine {
    pub line_id: i64,
    pub ticket_id: String,
    pub key: MatchKey,
    pub product_name: String,
    pub original_amount: i64,
    pub remaining: i64,
    pub batch_id: Option<String>,
    pub create_time: i64,
    pub last_update: i64,
}

/// A refund/credit item to be absorbed by blue lines of the same key.
/// `amount` is the positive magnitude of the refund, in cents.
#[derive(Clone, Debug)]
pub struct NegativeInvoice {
    pub negative_invoice_id: String,
    pub key: MatchKey,
    pub amount: i64,
    /// Higher first under the `priority_desc` sort strategy.
    pub priority: i32,
}

/// A single (negative, blue line, amount) triple. Ephemeral until the
/// group's plan commits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MatchAllocation {
    pub negative_invoice_id: String,
    pub blue_line_id: i64,
    pub amount_used: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Matched,
    Partial,
    Unmatched,
}

/// Per-negative outcome returned to the caller.
#[derive(Clone, Debug, Serialize)]
pub struct MatchResult {
    pub negative_invoice_id: String,
    pub status: MatchStatus,
    pub allocations: Vec<MatchAllocation>,
    pub total_allocated: i64,
    pub shortfall: i64,
    /// Stable lower-snake failure class (`contention_exceeded`,
    /// `timeout_exceeded`, ...) when the group could not be processed.
    pub error: Option<String>,
}

impl MatchResult {
    pub fn unmatched(negative_invoice_id: String, amount: i64, error: Option<String>) -> Self {
        Self {
            negative_invoice_id,
            status: MatchStatus::Unmatched,
            allocations: Vec::new(),
            total_allocated: 0,
            shortfall: amount,
            error,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Running => "running",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

/// Aggregate row written to the `test_results` reporting sink when a
/// batch finishes. Formatting and presentation are external concerns.
#[derive(Clone, Debug, Serialize)]
pub struct BatchReport {
    pub batch_id: String,
    pub total_negatives: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub total_amount: i64,
    pub matched_amount: i64,
    pub execution_time_ms: u64,
    pub fragment_created: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_equality_ignores_nothing() {
        let a = MatchKey::new(13, 1, 1);
        let b = MatchKey::new(13, 1, 1);
        let c = MatchKey::new(13, 2, 1);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn key_ordering_is_lexicographic() {
        let mut keys = vec![
            MatchKey::new(13, 2, 1),
            MatchKey::new(6, 9, 9),
            MatchKey::new(13, 1, 5),
        ];
        keys.sort();

        assert_eq!(keys[0], MatchKey::new(6, 9, 9));
        assert_eq!(keys[1], MatchKey::new(13, 1, 5));
        assert_eq!(keys[2], MatchKey::new(13, 2, 1));
    }

    #[test]
    fn unmatched_result_carries_full_shortfall() {
        let r = MatchResult::unmatched("N1".into(), 12_000, Some("contention_exceeded".into()));

        assert_eq!(r.status, MatchStatus::Unmatched);
        assert!(r.allocations.is_empty());
        assert_eq!(r.total_allocated, 0);
        assert_eq!(r.shortfall, 12_000);
        assert_eq!(r.error.as_deref(), Some("contention_exceeded"));
    }
}
