use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::invoice::model::{MatchAllocation, NegativeInvoice};

/// A blue line projected down to what allocation needs: its identity and
/// its balance at fetch time. Candidates are produced by the store already
/// sorted per the requested order, ties broken by `line_id` ascending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub line_id: i64,
    /// Unconsumed balance in cents; strictly positive at read time.
    pub remaining: i64,
}

/// Ordering applied to negatives within a group before allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegativeOrder {
    #[default]
    AmountDesc,
    AmountAsc,
    PriorityDesc,
}

impl NegativeOrder {
    /// Comparator with a stable `negative_invoice_id` tiebreak, so that a
    /// fixed input always yields the same allocation plan.
    pub fn compare(&self, a: &NegativeInvoice, b: &NegativeInvoice) -> Ordering {
        let primary = match self {
            NegativeOrder::AmountDesc => b.amount.cmp(&a.amount),
            NegativeOrder::AmountAsc => a.amount.cmp(&b.amount),
            NegativeOrder::PriorityDesc => b.priority.cmp(&a.priority),
        };
        primary.then_with(|| a.negative_invoice_id.cmp(&b.negative_invoice_id))
    }
}

/// Ordering requested from the candidate provider.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateOrder {
    RemainingAsc,
    #[default]
    RemainingDesc,
    LineIdAsc,
}

/// Planned balance deduction for one blue line: the sum of every
/// allocation the plan draws from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decrement {
    pub line_id: i64,
    pub amount: i64,
}

/// One group's committed unit of work: balance decrements plus the match
/// records backing them. Decrements are ordered by ascending `line_id`;
/// the coordinator relies on that order for its locking discipline.
#[derive(Clone, Debug, Default)]
pub struct GroupPlan {
    pub decrements: Vec<Decrement>,
    pub allocations: Vec<MatchAllocation>,
}

impl GroupPlan {
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
