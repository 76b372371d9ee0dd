use std::fmt;

use crate::model::ItemStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum ReconError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (bad weights, unordered thresholds, etc.).
    Configuration(String),
    /// Unknown item, source or match record.
    NotFound { kind: &'static str, id: String },
    /// The item is already a member of an active match (or lost a claim race).
    AlreadyLinked { item_id: String },
    /// Unlink requested on a record that is already soft-deleted.
    AlreadyDeleted { match_id: String },
    /// Many-side sum does not equal the one-side amount within tolerance.
    CardinalityMismatch {
        expected: i64,
        actual: i64,
        delta: i64,
        allowed: u64,
    },
    /// String input longer than the similarity limit.
    LengthExceeded { len: usize, max: usize },
    /// Structurally invalid match group (empty side, duplicate id, self match).
    InvalidGroup(String),
    /// Items of one group belong to different owners.
    OwnerMismatch { item_id: String, expected: String, found: String },
    /// Item exists but its status forbids matching (rejected / excluded).
    IneligibleItem { item_id: String, status: ItemStatus },
    /// Compare-and-set found an item in an unexpected status.
    StatusConflict { item_id: String, expected: ItemStatus, found: ItemStatus },
    /// Missing required column in CSV input.
    MissingColumn { source: String, column: String },
    /// Date parse error.
    DateParse { source: String, item_id: String, value: String },
    /// Amount parse error.
    AmountParse { source: String, item_id: String, value: String },
    /// Backing store failure.
    Storage(String),
    /// IO error (file read, sink write, etc.).
    Io(String),
}

impl ReconError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn already_linked(item_id: impl Into<String>) -> Self {
        Self::AlreadyLinked { item_id: item_id.into() }
    }

    /// Errors that reject input up front rather than per item.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::ConfigParse(_) | Self::Configuration(_))
    }
}

impl fmt::Display for ReconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Self::NotFound { kind, id } => write!(f, "{kind} not found: {id}"),
            Self::AlreadyLinked { item_id } => {
                write!(f, "item '{item_id}' is already linked to an active match")
            }
            Self::AlreadyDeleted { match_id } => {
                write!(f, "match '{match_id}' is already unlinked")
            }
            Self::CardinalityMismatch { expected, actual, delta, allowed } => write!(
                f,
                "cardinality mismatch: many-side sums to {actual}, one-side is {expected} \
                 (delta {delta}, allowed {allowed})"
            ),
            Self::LengthExceeded { len, max } => {
                write!(f, "input length {len} exceeds maximum {max}")
            }
            Self::InvalidGroup(msg) => write!(f, "invalid match group: {msg}"),
            Self::OwnerMismatch { item_id, expected, found } => write!(
                f,
                "item '{item_id}' belongs to owner '{found}', expected '{expected}'"
            ),
            Self::IneligibleItem { item_id, status } => {
                write!(f, "item '{item_id}' is {status} and cannot be matched")
            }
            Self::StatusConflict { item_id, expected, found } => write!(
                f,
                "item '{item_id}' is {found}, expected {expected}"
            ),
            Self::MissingColumn { source, column } => {
                write!(f, "source '{source}': missing column '{column}'")
            }
            Self::DateParse { source, item_id, value } => {
                write!(f, "source '{source}', item '{item_id}': cannot parse date '{value}'")
            }
            Self::AmountParse { source, item_id, value } => {
                write!(f, "source '{source}', item '{item_id}': cannot parse amount '{value}'")
            }
            Self::Storage(msg) => write!(f, "storage error: {msg}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for ReconError {}

impl From<std::io::Error> for ReconError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
