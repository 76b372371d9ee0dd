use crate::config::ThresholdConfig;
use crate::model::DecisionTier;

/// Maps a confidence to a decision tier.
///
/// Lower bounds are inclusive: a confidence exactly on a threshold lands in
/// the higher tier. NaN is treated as `NoMatch`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionClassifier {
    thresholds: ThresholdConfig,
}

impl DecisionClassifier {
    /// Thresholds are assumed validated (`ReconConfig::validate`).
    pub fn new(thresholds: ThresholdConfig) -> Self {
        Self { thresholds }
    }

    pub fn classify(&self, confidence: f64) -> DecisionTier {
        let t = &self.thresholds;
        if confidence >= t.auto_link {
            DecisionTier::AutoLink
        } else if confidence >= t.suggest {
            DecisionTier::AutoSuggest
        } else if confidence >= t.manual {
            DecisionTier::ManualReview
        } else {
            DecisionTier::NoMatch
        }
    }
}
