//! Field comparator plugins.
//!
//! The engine never interprets domain fields itself. Currency, patient id,
//! jurisdiction and the like arrive as comparators registered once at
//! construction. A comparator flagged `is_blocking` acts as an exact-match
//! partition filter: candidates survive blocking only when it returns 1.0.

use std::sync::Arc;

use serde::Deserialize;

use crate::error::ReconError;
use crate::model::MatchableItem;
use crate::similarity::{SimilarityOptions, TextAlgorithm};

/// Names reserved for the built-in amount and date features.
pub const RESERVED_FEATURES: [&str; 2] = ["amount", "date"];

pub trait FieldComparator: Send + Sync {
    fn name(&self) -> &str;

    /// Default weight; a `[weights]` entry with the same name overrides it.
    fn weight(&self) -> f64;

    fn is_blocking(&self) -> bool {
        false
    }

    /// Similarity in [0, 1]. Must be pure.
    fn compare(&self, a: &MatchableItem, b: &MatchableItem) -> Result<f64, ReconError>;
}

pub type SharedComparator = Arc<dyn FieldComparator>;

// ---------------------------------------------------------------------------
// Declarative specs (TOML `[[comparators]]`)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparatorKind {
    Text,
    Exact,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComparatorSpec {
    pub name: String,
    pub kind: ComparatorKind,
    /// `"label"` or an attribute key.
    pub field: String,
    #[serde(default = "default_algorithm")]
    pub algorithm: TextAlgorithm,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub blocking: bool,
}

fn default_algorithm() -> TextAlgorithm {
    TextAlgorithm::JaroWinkler
}

/// Instantiate the built-in comparators described by `specs`, in order.
pub fn build_comparators(specs: &[ComparatorSpec], options: &SimilarityOptions) -> Vec<SharedComparator> {
    specs
        .iter()
        .map(|spec| -> SharedComparator {
            match spec.kind {
                ComparatorKind::Text => Arc::new(TextComparator {
                    name: spec.name.clone(),
                    field: spec.field.clone(),
                    algorithm: spec.algorithm,
                    weight: spec.weight,
                    blocking: spec.blocking,
                    options: *options,
                }),
                ComparatorKind::Exact => Arc::new(ExactComparator {
                    name: spec.name.clone(),
                    field: spec.field.clone(),
                    weight: spec.weight,
                    blocking: spec.blocking,
                }),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// String similarity over the label or one attribute. Missing values score 0.
#[derive(Debug, Clone)]
pub struct TextComparator {
    pub name: String,
    pub field: String,
    pub algorithm: TextAlgorithm,
    pub weight: f64,
    pub blocking: bool,
    pub options: SimilarityOptions,
}

impl FieldComparator for TextComparator {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn compare(&self, a: &MatchableItem, b: &MatchableItem) -> Result<f64, ReconError> {
        match (a.field(&self.field), b.field(&self.field)) {
            (Some(x), Some(y)) => self.algorithm.similarity(x, y, &self.options),
            _ => Ok(0.0),
        }
    }
}

/// 1.0 when both items carry the same (trimmed) value for `field`.
#[derive(Debug, Clone)]
pub struct ExactComparator {
    pub name: String,
    pub field: String,
    pub weight: f64,
    pub blocking: bool,
}

impl ExactComparator {
    /// Zero-weight blocking partition on one attribute.
    pub fn partition(field: &str) -> Self {
        Self {
            name: field.to_string(),
            field: field.to_string(),
            weight: 0.0,
            blocking: true,
        }
    }
}

impl FieldComparator for ExactComparator {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn compare(&self, a: &MatchableItem, b: &MatchableItem) -> Result<f64, ReconError> {
        Ok(match (a.field(&self.field), b.field(&self.field)) {
            (Some(x), Some(y)) if x.trim() == y.trim() => 1.0,
            _ => 0.0,
        })
    }
}

type CompareFn = dyn Fn(&MatchableItem, &MatchableItem) -> Result<f64, ReconError> + Send + Sync;

/// Comparator backed by a closure, for callers with bespoke field logic.
pub struct FnComparator {
    name: String,
    weight: f64,
    blocking: bool,
    compare: Box<CompareFn>,
}

impl FnComparator {
    pub fn new<F>(name: &str, weight: f64, blocking: bool, compare: F) -> Self
    where
        F: Fn(&MatchableItem, &MatchableItem) -> Result<f64, ReconError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            weight,
            blocking,
            compare: Box::new(compare),
        }
    }
}

impl FieldComparator for FnComparator {
    fn name(&self) -> &str {
        &self.name
    }

    fn weight(&self) -> f64 {
        self.weight
    }

    fn is_blocking(&self) -> bool {
        self.blocking
    }

    fn compare(&self, a: &MatchableItem, b: &MatchableItem) -> Result<f64, ReconError> {
        (self.compare)(a, b)
    }
}

impl std::fmt::Debug for FnComparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnComparator")
            .field("name", &self.name)
            .field("weight", &self.weight)
            .field("blocking", &self.blocking)
            .finish()
    }
}
