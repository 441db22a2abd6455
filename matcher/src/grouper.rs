//! Partitions a batch's negatives into independent key-groups.
//!
//! Groups are the unit of parallelism: disjoint keys mean disjoint
//! candidate sets, so workers never contend within one batch. Groups are
//! emitted largest aggregate magnitude first to amortize warm-cache
//! benefits; negatives within a group are pre-ordered for the allocator.

use std::collections::HashMap;

use crate::allocator::types::NegativeOrder;
use crate::invoice::model::{MatchKey, NegativeInvoice};

/// One key's worth of negatives, ordered and summed.
#[derive(Clone, Debug)]
pub struct KeyGroup {
    pub key: MatchKey,
    pub negatives: Vec<NegativeInvoice>,
    /// Aggregate demand in cents; drives group dispatch order.
    pub total_amount: i64,
}

/// Partition `negatives` by `(tax_rate, buyer_id, seller_id)`.
///
/// Within a group negatives are sorted per `order`; groups are returned
/// in descending `total_amount` order, ties broken by key ascending so a
/// fixed input yields a fixed dispatch sequence.
pub fn group_negatives(negatives: Vec<NegativeInvoice>, order: NegativeOrder) -> Vec<KeyGroup> {
    let mut by_key: HashMap<MatchKey, Vec<NegativeInvoice>> = HashMap::new();
    for n in negatives {
        by_key.entry(n.key).or_default().push(n);
    }

    let mut groups: Vec<KeyGroup> = by_key
        .into_iter()
        .map(|(key, mut members)| {
            members.sort_by(|a, b| order.compare(a, b));
            let total_amount = members.iter().map(|n| n.amount).sum();
            KeyGroup {
                key,
                negatives: members,
                total_amount,
            }
        })
        .collect();

    groups.sort_by(|a, b| {
        b.total_amount
            .cmp(&a.total_amount)
            .then_with(|| a.key.cmp(&b.key))
    });

    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neg(id: &str, key: MatchKey, amount: i64) -> NegativeInvoice {
        NegativeInvoice {
            negative_invoice_id: id.to_string(),
            key,
            amount,
            priority: 0,
        }
    }

    #[test]
    fn partitions_by_full_triple() {
        let k1 = MatchKey::new(13, 1, 1);
        let k2 = MatchKey::new(13, 2, 1);
        let k3 = MatchKey::new(6, 1, 1);

        let groups = group_negatives(
            vec![
                neg("A", k1, 100),
                neg("B", k2, 100),
                neg("C", k1, 100),
                neg("D", k3, 100),
            ],
            NegativeOrder::AmountDesc,
        );

        assert_eq!(groups.len(), 3);
        let sizes: Vec<usize> = groups.iter().map(|g| g.negatives.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 4);
        assert!(
            groups
                .iter()
                .all(|g| g.negatives.iter().all(|n| n.key == g.key))
        );
    }

    #[test]
    fn groups_emitted_largest_first() {
        let small = MatchKey::new(13, 1, 1);
        let large = MatchKey::new(13, 2, 2);

        let groups = group_negatives(
            vec![
                neg("A", small, 500),
                neg("B", large, 900),
                neg("C", large, 800),
            ],
            NegativeOrder::AmountDesc,
        );

        assert_eq!(groups[0].key, large);
        assert_eq!(groups[0].total_amount, 1_700);
        assert_eq!(groups[1].key, small);
        assert_eq!(groups[1].total_amount, 500);
    }

    #[test]
    fn equal_magnitude_groups_tiebreak_by_key() {
        let a = MatchKey::new(13, 2, 1);
        let b = MatchKey::new(13, 1, 1);

        let groups = group_negatives(
            vec![neg("A", a, 300), neg("B", b, 300)],
            NegativeOrder::AmountDesc,
        );

        assert_eq!(groups[0].key, b);
        assert_eq!(groups[1].key, a);
    }

    #[test]
    fn negatives_within_group_follow_sort_strategy() {
        let k = MatchKey::new(13, 1, 1);

        let groups = group_negatives(
            vec![neg("A", k, 100), neg("B", k, 900), neg("C", k, 500)],
            NegativeOrder::AmountDesc,
        );

        let amounts: Vec<i64> = groups[0].negatives.iter().map(|n| n.amount).collect();
        assert_eq!(amounts, vec![900, 500, 100]);
    }

    #[test]
    fn empty_input_produces_no_groups() {
        let groups = group_negatives(vec![], NegativeOrder::AmountDesc);
        assert!(groups.is_empty());
    }
}
