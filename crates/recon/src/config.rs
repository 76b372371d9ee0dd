use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::comparator::{ComparatorSpec, SharedComparator, RESERVED_FEATURES};
use crate::error::ReconError;
use crate::similarity::SimilarityOptions;

/// Allowed drift of the weight sum around 1.0.
pub const WEIGHT_SUM_EPSILON: f64 = 0.01;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ReconConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub tolerance: ToleranceConfig,
    pub weights: BTreeMap<String, f64>,
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub blocking: BlockingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub similarity: SimilarityOptions,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub comparators: Vec<ComparatorSpec>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
    #[serde(default)]
    pub pair: Option<PairConfig>,
}

fn default_name() -> String {
    "reconciliation".into()
}

// ---------------------------------------------------------------------------
// Tolerance + Blocking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct ToleranceConfig {
    /// Relative amount tolerance, in percent of the reference amount.
    #[serde(default)]
    pub amount_pct: f64,
    #[serde(default)]
    pub date_days: u32,
}

/// Fixed-point scale for percentages: 1% == 1_000_000 units.
const PCT_SCALE: f64 = 1_000_000.0;

/// Absolute allowance in minor units for `pct` percent of `reference`.
///
/// Floored, so for integer amounts `|x - reference| <= allowance` is exactly
/// `|x - reference| <= reference * pct / 100`. The percentage is fixed to
/// six decimals and the product taken in integers.
pub fn amount_allowance(reference: u64, pct: f64) -> u64 {
    if !pct.is_finite() || pct <= 0.0 {
        return 0;
    }
    let scaled = (pct * PCT_SCALE).round() as u128;
    match u128::from(reference).checked_mul(scaled) {
        Some(product) => u64::try_from(product / (100 * PCT_SCALE as u128)).unwrap_or(u64::MAX),
        None => u64::MAX,
    }
}

/// Blocking windows. Unset fields fall back to the scoring tolerance.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct BlockingConfig {
    #[serde(default)]
    pub amount_pct: Option<f64>,
    #[serde(default)]
    pub date_days: Option<u32>,
}

/// Resolved blocking window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockingWindow {
    pub amount_pct: f64,
    pub date_days: u32,
}

// ---------------------------------------------------------------------------
// Thresholds + Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ThresholdConfig {
    pub manual: f64,
    pub suggest: f64,
    pub auto_link: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Same-sign pairs score 0.0 when set (debit vs credit matching).
    #[serde(default)]
    pub require_opposite_sign: bool,
    #[serde(default)]
    pub auto_accept: bool,
}

fn default_max_candidates() -> usize {
    10
}

fn default_batch_size() -> usize {
    1000
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            min_confidence: 0.0,
            batch_size: default_batch_size(),
            require_opposite_sign: false,
            auto_accept: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

fn default_true() -> bool {
    true
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_max_entries() -> u64 {
    10_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources (CSV ingestion)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub file: String,
    /// Owner for every row when no owner column is mapped.
    #[serde(default)]
    pub owner: Option<String>,
    pub columns: ColumnMapping,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub id: String,
    pub amount: String,
    pub date: String,
    pub label: String,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    pub left: String,
    pub right: String,
}

// ---------------------------------------------------------------------------
// Resolved weights
// ---------------------------------------------------------------------------

/// Weights aligned with the registered comparator list.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureWeights {
    pub amount: f64,
    pub date: f64,
    pub comparators: Vec<f64>,
}

impl FeatureWeights {
    pub fn sum(&self) -> f64 {
        self.amount + self.date + self.comparators.iter().sum::<f64>()
    }
}

// ---------------------------------------------------------------------------
// Parse + Validate
// ---------------------------------------------------------------------------

fn check_unit(label: &str, value: f64) -> Result<(), ReconError> {
    if !value.is_finite() || !(0.0..=1.0).contains(&value) {
        return Err(ReconError::Configuration(format!(
            "{label} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

fn check_pct(label: &str, value: f64) -> Result<(), ReconError> {
    if !value.is_finite() || value < 0.0 {
        return Err(ReconError::Configuration(format!(
            "{label} must be a non-negative percentage, got {value}"
        )));
    }
    Ok(())
}

impl ReconConfig {
    pub fn from_toml(input: &str) -> Result<Self, ReconError> {
        let config: ReconConfig =
            toml::from_str(input).map_err(|e| ReconError::ConfigParse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that do not depend on the registered comparators.
    pub fn validate(&self) -> Result<(), ReconError> {
        // Tolerances
        check_pct("tolerance.amount_pct", self.tolerance.amount_pct)?;
        if let Some(pct) = self.blocking.amount_pct {
            check_pct("blocking.amount_pct", pct)?;
        }

        // Built-in weights are mandatory
        for key in RESERVED_FEATURES {
            match self.weights.get(key) {
                Some(w) => check_unit(&format!("weights.{key}"), *w)?,
                None => {
                    return Err(ReconError::Configuration(format!(
                        "weights.{key} is required"
                    )))
                }
            }
        }
        for (key, w) in &self.weights {
            check_unit(&format!("weights.{key}"), *w)?;
        }

        // Thresholds: each in [0, 1] and strictly ordered
        let t = &self.thresholds;
        check_unit("thresholds.manual", t.manual)?;
        check_unit("thresholds.suggest", t.suggest)?;
        check_unit("thresholds.auto_link", t.auto_link)?;
        if !(t.manual < t.suggest && t.suggest < t.auto_link) {
            return Err(ReconError::Configuration(format!(
                "thresholds must satisfy manual < suggest < auto_link, got {} / {} / {}",
                t.manual, t.suggest, t.auto_link
            )));
        }

        // Matching limits
        if self.matching.max_candidates == 0 {
            return Err(ReconError::Configuration("matching.max_candidates must be at least 1".into()));
        }
        if self.matching.batch_size == 0 {
            return Err(ReconError::Configuration("matching.batch_size must be at least 1".into()));
        }
        check_unit("matching.min_confidence", self.matching.min_confidence)?;
        if self.similarity.max_len == 0 {
            return Err(ReconError::Configuration("similarity.max_len must be at least 1".into()));
        }

        // Comparator specs: unique, non-reserved names
        let mut seen = HashSet::new();
        for spec in &self.comparators {
            if RESERVED_FEATURES.contains(&spec.name.as_str()) {
                return Err(ReconError::Configuration(format!(
                    "comparator name '{}' is reserved",
                    spec.name
                )));
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(ReconError::Configuration(format!(
                    "duplicate comparator name '{}'",
                    spec.name
                )));
            }
            check_unit(&format!("comparator '{}' weight", spec.name), spec.weight)?;
        }

        // Pair must reference declared sources
        if let Some(pair) = &self.pair {
            for side in [&pair.left, &pair.right] {
                if !self.sources.contains_key(side) {
                    return Err(ReconError::Configuration(format!(
                        "pair references unknown source '{side}'"
                    )));
                }
            }
            if pair.left == pair.right {
                return Err(ReconError::Configuration(
                    "pair must name two different sources".into(),
                ));
            }
        }

        Ok(())
    }

    /// Resolve per-feature weights against the registered comparators and
    /// enforce the sum invariant.
    pub fn resolve_weights(&self, comparators: &[SharedComparator]) -> Result<FeatureWeights, ReconError> {
        let mut names = HashSet::new();
        for c in comparators {
            if RESERVED_FEATURES.contains(&c.name()) {
                return Err(ReconError::Configuration(format!(
                    "comparator name '{}' is reserved",
                    c.name()
                )));
            }
            if !names.insert(c.name()) {
                return Err(ReconError::Configuration(format!(
                    "duplicate comparator name '{}'",
                    c.name()
                )));
            }
        }

        for key in self.weights.keys() {
            if !RESERVED_FEATURES.contains(&key.as_str()) && !names.contains(key.as_str()) {
                return Err(ReconError::Configuration(format!(
                    "weight '{key}' names no registered comparator"
                )));
            }
        }

        let mut comparator_weights = Vec::with_capacity(comparators.len());
        for c in comparators {
            let w = self.weights.get(c.name()).copied().unwrap_or_else(|| c.weight());
            check_unit(&format!("comparator '{}' weight", c.name()), w)?;
            comparator_weights.push(w);
        }

        let weights = FeatureWeights {
            amount: self.weights.get("amount").copied().unwrap_or(0.0),
            date: self.weights.get("date").copied().unwrap_or(0.0),
            comparators: comparator_weights,
        };

        let sum = weights.sum();
        if !((1.0 - WEIGHT_SUM_EPSILON)..=(1.0 + WEIGHT_SUM_EPSILON)).contains(&sum) {
            return Err(ReconError::Configuration(format!(
                "weights must sum to 1.0 ± {WEIGHT_SUM_EPSILON}, got {sum:.4}"
            )));
        }

        Ok(weights)
    }

    pub fn blocking_window(&self) -> BlockingWindow {
        BlockingWindow {
            amount_pct: self.blocking.amount_pct.unwrap_or(self.tolerance.amount_pct),
            date_days: self.blocking.date_days.unwrap_or(self.tolerance.date_days),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
