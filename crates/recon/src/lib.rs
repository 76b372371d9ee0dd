//! `reconmatch`: fuzzy multi-source entity reconciliation engine.
//!
//! Finds correspondences between items of independently sourced
//! collections: blocking narrows the pool, weighted comparators score the
//! survivors, thresholds classify them, and the reconciler persists matches
//! through an atomic claim. Storage and audit are injected through traits.

pub mod audit;
pub mod blocking;
pub mod cache;
pub mod classify;
pub mod comparator;
pub mod config;
pub mod error;
pub mod loader;
pub mod model;
pub mod orchestrator;
pub mod scoring;
pub mod similarity;
pub mod store;

pub use comparator::{build_comparators, FieldComparator, SharedComparator};
pub use config::ReconConfig;
pub use error::ReconError;
pub use model::{
    BulkReport, DecisionTier, ItemStatus, MatchCandidate, MatchGroup, MatchRecord, MatchableItem, ReconStats,
};
pub use orchestrator::{BulkRequest, CancelFlag, Reconciler};
