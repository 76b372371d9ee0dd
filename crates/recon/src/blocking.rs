//! Candidate reduction ahead of scoring.
//!
//! The pool is indexed once in a `BTreeMap` keyed by absolute amount; each
//! bucket is sorted by date. A lookup is one range query on the amount
//! window plus a binary search into each bucket for the date window, so an
//! item costs O(log m + k) instead of a scan over all m pool entries.
//! Blocking comparators are then applied to the survivors only.

use std::collections::BTreeMap;

use crate::comparator::SharedComparator;
use crate::config::{amount_allowance, BlockingWindow};
use crate::error::ReconError;
use crate::model::{DateRange, MatchableItem};

pub struct BlockingIndex<'a> {
    by_amount: BTreeMap<u64, Vec<&'a MatchableItem>>,
    window: BlockingWindow,
    len: usize,
}

impl<'a> BlockingIndex<'a> {
    pub fn build(pool: &'a [MatchableItem], window: BlockingWindow) -> Self {
        let mut by_amount: BTreeMap<u64, Vec<&'a MatchableItem>> = BTreeMap::new();
        for item in pool {
            by_amount.entry(item.amount_minor.unsigned_abs()).or_default().push(item);
        }
        for bucket in by_amount.values_mut() {
            bucket.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
        }
        Self {
            by_amount,
            window,
            len: pool.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inclusive absolute-amount bounds for `amount`.
    pub fn amount_bounds(&self, amount: i64) -> (u64, u64) {
        let abs = amount.unsigned_abs();
        let allowance = amount_allowance(abs, self.window.amount_pct);
        (abs.saturating_sub(allowance), abs.saturating_add(allowance))
    }

    pub fn date_bounds(&self, item: &MatchableItem) -> DateRange {
        DateRange::around(item.date, self.window.date_days)
    }

    /// Pool entries inside the amount and date windows that every blocking
    /// comparator scores exactly 1.0. Never returns `item` itself.
    pub fn candidates(
        &self,
        item: &MatchableItem,
        comparators: &[SharedComparator],
    ) -> Result<Vec<&'a MatchableItem>, ReconError> {
        let (lo, hi) = self.amount_bounds(item.amount_minor);
        let dates = self.date_bounds(item);
        let blocking: Vec<&SharedComparator> = comparators.iter().filter(|c| c.is_blocking()).collect();

        let mut out = Vec::new();
        for bucket in self.by_amount.range(lo..=hi).map(|(_, bucket)| bucket) {
            let start = bucket.partition_point(|c| c.date < dates.start);
            for candidate in &bucket[start..] {
                if candidate.date > dates.end {
                    break;
                }
                if candidate.id == item.id {
                    continue;
                }
                if passes_partitions(&blocking, item, candidate)? {
                    out.push(*candidate);
                }
            }
        }
        Ok(out)
    }
}

fn passes_partitions(
    blocking: &[&SharedComparator],
    item: &MatchableItem,
    candidate: &MatchableItem,
) -> Result<bool, ReconError> {
    for comparator in blocking {
        if comparator.compare(item, candidate)? != 1.0 {
            return Ok(false);
        }
    }
    Ok(true)
}
