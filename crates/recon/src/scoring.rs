//! Weighted multi-feature scoring.
//!
//! Amount and date are built-in piecewise-linear features; every registered
//! comparator contributes one more feature. The composite is the weighted
//! sum, clamped into [0, 1], returned with a per-feature breakdown.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use rayon::prelude::*;

use crate::comparator::SharedComparator;
use crate::config::{FeatureWeights, ToleranceConfig};
use crate::error::ReconError;
use crate::model::MatchableItem;

/// Breakdown key recorded when the opposite-sign gate rejects a pair.
pub const OPPOSITE_SIGN_GATE: &str = "opposite_sign";

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPair {
    pub confidence: f64,
    pub features: BTreeMap<String, f64>,
}

/// 1.0 at equal magnitudes, linear to 0.0 at `tolerance_pct` relative
/// difference (against the larger magnitude), 0.0 beyond. Signs are ignored.
pub fn amount_score(a: i64, b: i64, tolerance_pct: f64) -> f64 {
    let (x, y) = (a.unsigned_abs() as f64, b.unsigned_abs() as f64);
    let larger = x.max(y);
    if larger == 0.0 {
        return 1.0;
    }
    let diff = (x - y).abs() / larger;
    let tol = tolerance_pct / 100.0;
    if tol <= 0.0 {
        return if diff == 0.0 { 1.0 } else { 0.0 };
    }
    if diff >= tol {
        0.0
    } else {
        1.0 - diff / tol
    }
}

/// 1.0 on the same day, linear to 0.0 at `window_days` apart, 0.0 beyond.
pub fn date_score(a: NaiveDate, b: NaiveDate, window_days: u32) -> f64 {
    let apart = (a - b).num_days().unsigned_abs();
    if window_days == 0 {
        return if apart == 0 { 1.0 } else { 0.0 };
    }
    if apart >= window_days as u64 {
        0.0
    } else {
        1.0 - apart as f64 / window_days as f64
    }
}

fn same_sign(a: i64, b: i64) -> bool {
    (a > 0 && b > 0) || (a < 0 && b < 0)
}

pub struct FeatureScorer {
    tolerance: ToleranceConfig,
    require_opposite_sign: bool,
    weights: FeatureWeights,
    comparators: Vec<SharedComparator>,
}

impl FeatureScorer {
    /// `weights.comparators` must be aligned with `comparators`
    /// (see `ReconConfig::resolve_weights`).
    pub fn new(
        tolerance: ToleranceConfig,
        require_opposite_sign: bool,
        weights: FeatureWeights,
        comparators: Vec<SharedComparator>,
    ) -> Self {
        debug_assert_eq!(weights.comparators.len(), comparators.len());
        Self {
            tolerance,
            require_opposite_sign,
            weights,
            comparators,
        }
    }

    pub fn comparators(&self) -> &[SharedComparator] {
        &self.comparators
    }

    pub fn score(&self, item: &MatchableItem, candidate: &MatchableItem) -> Result<ScoredPair, ReconError> {
        let mut features = BTreeMap::new();

        if self.require_opposite_sign && same_sign(item.amount_minor, candidate.amount_minor) {
            features.insert(OPPOSITE_SIGN_GATE.to_string(), 0.0);
            return Ok(ScoredPair { confidence: 0.0, features });
        }

        let amount = amount_score(item.amount_minor, candidate.amount_minor, self.tolerance.amount_pct);
        let date = date_score(item.date, candidate.date, self.tolerance.date_days);
        let mut total = self.weights.amount * amount + self.weights.date * date;
        features.insert("amount".to_string(), amount);
        features.insert("date".to_string(), date);

        for (comparator, weight) in self.comparators.iter().zip(&self.weights.comparators) {
            let s = comparator.compare(item, candidate)?.clamp(0.0, 1.0);
            total += weight * s;
            features.insert(comparator.name().to_string(), s);
        }

        Ok(ScoredPair {
            confidence: total.clamp(0.0, 1.0),
            features,
        })
    }

    /// Score every candidate on the rayon pool. Output order follows input.
    pub fn score_all<'a>(
        &self,
        item: &MatchableItem,
        candidates: &[&'a MatchableItem],
    ) -> Vec<(&'a MatchableItem, Result<ScoredPair, ReconError>)> {
        candidates
            .par_iter()
            .map(|c| (*c, self.score(item, c)))
            .collect()
    }
}
