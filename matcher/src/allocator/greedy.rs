use std::collections::BTreeMap;

use tracing::debug;

use crate::allocator::types::{Candidate, Decrement, GroupPlan, NegativeOrder};
use crate::invoice::model::{MatchAllocation, MatchResult, MatchStatus, NegativeInvoice};

/// Output of one allocation pass over a single key-group.
#[derive(Clone, Debug)]
pub struct GroupAllocation {
    /// Per-negative results in allocation order.
    pub results: Vec<MatchResult>,
    /// The decrements and match records to commit (empty if nothing was
    /// allocated; the coordinator then skips the store entirely).
    pub plan: GroupPlan,
    /// Candidates whose balance was driven below the fragment threshold
    /// without reaching zero. Informational, not corrective.
    pub fragments_created: u64,
}

/// Greedy allocation over an in-memory candidate list for one key-group.
///
/// Negatives are sorted per `order` (stable `negative_invoice_id`
/// tiebreak); a cursor walks the candidates in their provided order,
/// draining each one before advancing. Given identical inputs this is a
/// pure function: no I/O, no clock, no randomness.
///
/// All arithmetic is integer cents; comparisons are exact.
pub fn allocate(
    negatives: &[NegativeInvoice],
    candidates: &[Candidate],
    order: NegativeOrder,
    fragment_threshold: i64,
) -> GroupAllocation {
    let mut ordered: Vec<&NegativeInvoice> = negatives.iter().collect();
    ordered.sort_by(|a, b| order.compare(a, b));

    let mut working: Vec<Candidate> = candidates.to_vec();
    let mut cursor = 0usize;

    // BTreeMap keeps decrements in ascending line_id order, which the
    // persistence coordinator requires for its lock ordering.
    let mut used: BTreeMap<i64, i64> = BTreeMap::new();
    let mut allocations: Vec<MatchAllocation> = Vec::new();
    let mut results: Vec<MatchResult> = Vec::with_capacity(ordered.len());

    for neg in ordered {
        let mut outstanding = neg.amount;
        let mut taken: Vec<MatchAllocation> = Vec::new();

        while outstanding > 0 && cursor < working.len() {
            let c = &mut working[cursor];
            if c.remaining == 0 {
                cursor += 1;
                continue;
            }

            let draw = outstanding.min(c.remaining);
            c.remaining -= draw;
            outstanding -= draw;
            *used.entry(c.line_id).or_insert(0) += draw;

            taken.push(MatchAllocation {
                negative_invoice_id: neg.negative_invoice_id.clone(),
                blue_line_id: c.line_id,
                amount_used: draw,
            });

            if c.remaining == 0 {
                cursor += 1;
            }
        }

        let total_allocated = neg.amount - outstanding;
        let status = if outstanding == 0 {
            MatchStatus::Matched
        } else if total_allocated > 0 {
            MatchStatus::Partial
        } else {
            MatchStatus::Unmatched
        };

        allocations.extend(taken.iter().cloned());
        results.push(MatchResult {
            negative_invoice_id: neg.negative_invoice_id.clone(),
            status,
            allocations: taken,
            total_allocated,
            shortfall: outstanding,
            error: None,
        });
    }

    let fragments_created = working
        .iter()
        .filter(|c| {
            used.contains_key(&c.line_id) && c.remaining > 0 && c.remaining < fragment_threshold
        })
        .count() as u64;

    let plan = GroupPlan {
        decrements: used
            .into_iter()
            .map(|(line_id, amount)| Decrement { line_id, amount })
            .collect(),
        allocations,
    };

    debug!(
        negatives = negatives.len(),
        candidates = candidates.len(),
        allocations = plan.allocations.len(),
        fragments_created,
        "group allocation derived"
    );

    GroupAllocation {
        results,
        plan,
        fragments_created,
    }
}
