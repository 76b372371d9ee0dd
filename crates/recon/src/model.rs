use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Unmatched,
    Matched,
    Rejected,
    Excluded,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unmatched => write!(f, "unmatched"),
            Self::Matched => write!(f, "matched"),
            Self::Rejected => write!(f, "rejected"),
            Self::Excluded => write!(f, "excluded"),
        }
    }
}

/// A single record from any source, normalized for matching.
///
/// `amount_minor` is in integer minor units (cents). `status` is the only
/// field the engine ever changes, and only through the item store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchableItem {
    pub id: String,
    pub source_id: String,
    pub owner: String,
    pub amount_minor: i64,
    pub date: NaiveDate,
    pub label: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub status: ItemStatus,
}

impl MatchableItem {
    /// Label or attribute value by field name. `"label"` selects the label.
    pub fn field(&self, name: &str) -> Option<&str> {
        if name == "label" {
            Some(self.label.as_str())
        } else {
            self.attributes.get(name).map(|v| v.as_str())
        }
    }
}

/// Inclusive date range used when loading items from a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Range centred on `date`, `days` either side, clamped to the
    /// representable calendar.
    pub fn around(date: NaiveDate, days: u32) -> Self {
        let span = chrono::Duration::days(i64::from(days));
        Self {
            start: date.checked_sub_signed(span).unwrap_or(NaiveDate::MIN),
            end: date.checked_add_signed(span).unwrap_or(NaiveDate::MAX),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

// ---------------------------------------------------------------------------
// Decision tiers
// ---------------------------------------------------------------------------

/// Ordered decision classes, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTier {
    NoMatch,
    ManualReview,
    AutoSuggest,
    AutoLink,
}

impl std::fmt::Display for DecisionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoMatch => write!(f, "no_match"),
            Self::ManualReview => write!(f, "manual_review"),
            Self::AutoSuggest => write!(f, "auto_suggest"),
            Self::AutoLink => write!(f, "auto_link"),
        }
    }
}

// ---------------------------------------------------------------------------
// Candidates
// ---------------------------------------------------------------------------

/// A scored candidate for one item. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub item: MatchableItem,
    pub confidence: f64,
    pub features: BTreeMap<String, f64>,
    pub tier: DecisionTier,
}

// ---------------------------------------------------------------------------
// Match records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    OneToOne,
    OneToMany,
    ManyToOne,
}

/// Members of a match, by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cardinality", rename_all = "snake_case")]
pub enum MatchGroup {
    Pairwise { left: String, right: String },
    OneToMany { one: String, many: Vec<String> },
    ManyToOne { many: Vec<String>, one: String },
}

impl MatchGroup {
    pub fn cardinality(&self) -> Cardinality {
        match self {
            Self::Pairwise { .. } => Cardinality::OneToOne,
            Self::OneToMany { .. } => Cardinality::OneToMany,
            Self::ManyToOne { .. } => Cardinality::ManyToOne,
        }
    }

    pub fn left_ids(&self) -> Vec<&str> {
        match self {
            Self::Pairwise { left, .. } => vec![left.as_str()],
            Self::OneToMany { one, .. } => vec![one.as_str()],
            Self::ManyToOne { many, .. } => many.iter().map(|s| s.as_str()).collect(),
        }
    }

    pub fn right_ids(&self) -> Vec<&str> {
        match self {
            Self::Pairwise { right, .. } => vec![right.as_str()],
            Self::OneToMany { many, .. } => many.iter().map(|s| s.as_str()).collect(),
            Self::ManyToOne { one, .. } => vec![one.as_str()],
        }
    }

    /// Left ids followed by right ids, in declaration order.
    pub fn member_ids(&self) -> Vec<String> {
        self.left_ids()
            .into_iter()
            .chain(self.right_ids())
            .map(str::to_string)
            .collect()
    }

    /// The single id and the many ids of a 1:N / N:1 group.
    pub fn one_and_many(&self) -> Option<(&str, &[String])> {
        match self {
            Self::Pairwise { .. } => None,
            Self::OneToMany { one, many } | Self::ManyToOne { many, one } => {
                Some((one.as_str(), many.as_slice()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Auto,
    Manual,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// A persisted match. Soft-deleted on unlink, never removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub id: Uuid,
    pub group: MatchGroup,
    pub detection_method: DetectionMethod,
    /// Set for `auto` records only; a manual assertion carries no score.
    pub confidence: Option<f64>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_by: Option<String>,
}

impl MatchRecord {
    pub fn manual(group: MatchGroup, actor: &str, reason: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            group,
            detection_method: DetectionMethod::Manual,
            confidence: None,
            created_by: actor.to_string(),
            created_at: Utc::now(),
            reason,
            deleted_at: None,
            deleted_by: None,
        }
    }

    /// Auto record; confidence is clamped into [0, 1].
    pub fn auto(group: MatchGroup, confidence: f64, actor: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            group,
            detection_method: DetectionMethod::Auto,
            confidence: Some(confidence.clamp(0.0, 1.0)),
            created_by: actor.to_string(),
            created_at: Utc::now(),
            reason: None,
            deleted_at: None,
            deleted_by: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// Bulk reporting
// ---------------------------------------------------------------------------

/// Advisory pairing from a bulk run. Not an active match.
#[derive(Debug, Clone, Serialize)]
pub struct Suggestion {
    pub item_id: String,
    pub candidate_id: String,
    pub confidence: f64,
    pub tier: DecisionTier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierCounts {
    pub no_match: usize,
    pub manual_review: usize,
    pub auto_suggest: usize,
    pub auto_link: usize,
}

impl TierCounts {
    pub fn record(&mut self, tier: DecisionTier) {
        match tier {
            DecisionTier::NoMatch => self.no_match += 1,
            DecisionTier::ManualReview => self.manual_review += 1,
            DecisionTier::AutoSuggest => self.auto_suggest += 1,
            DecisionTier::AutoLink => self.auto_link += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.no_match + self.manual_review + self.auto_suggest + self.auto_link
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkReport {
    pub source_a: String,
    pub source_b: String,
    pub processed: usize,
    pub batches: usize,
    pub tiers: TierCounts,
    pub linked: usize,
    /// Every candidate was already claimed, in this run or by another writer.
    pub conflicts: usize,
    pub errors: usize,
    pub cancelled: bool,
    pub suggestions: Vec<Suggestion>,
    pub linked_ids: Vec<Uuid>,
    pub elapsed_ms: u64,
    pub items_per_sec: f64,
}

/// Snapshot returned by `get_stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconStats {
    pub items_by_status: BTreeMap<ItemStatus, usize>,
    pub active_matches: usize,
    pub unlinked_matches: usize,
    pub auto_matches: usize,
    pub manual_matches: usize,
    pub bulk_runs: u64,
    pub auto_linked: u64,
    pub manual_created: u64,
    pub unlinked: u64,
    pub item_errors: u64,
    pub audit_failures: u64,
}
