//! Item and match persistence seams.
//!
//! The engine only talks to these traits. Every status transition goes
//! through `ItemStore::compare_and_set`, which is all-or-nothing across the
//! ids it is given; that is the claim that keeps two workers from linking
//! the same item twice. The in-memory implementations back tests and the CLI.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::ReconError;
use crate::model::{DateRange, ItemStatus, MatchRecord, MatchableItem};

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ItemStore: Send + Sync {
    fn get(&self, item_id: &str) -> Result<Option<MatchableItem>, ReconError>;

    /// Unmatched items of one source, optionally bounded by date.
    /// Unknown source → `NotFound`.
    fn load_unmatched(&self, source_id: &str, range: Option<DateRange>) -> Result<Vec<MatchableItem>, ReconError>;

    /// Move every id from `from` to `to`, or none of them.
    ///
    /// Fails with `NotFound` for an unknown id and `StatusConflict` when any
    /// item is not currently in `from`.
    fn compare_and_set(&self, item_ids: &[String], from: ItemStatus, to: ItemStatus) -> Result<(), ReconError>;

    fn status_counts(&self) -> Result<BTreeMap<ItemStatus, usize>, ReconError>;
}

pub trait MatchLedger: Send + Sync {
    /// Persist a new record. Rejects members already in an active record.
    fn insert(&self, record: MatchRecord) -> Result<(), ReconError>;

    fn get(&self, match_id: &Uuid) -> Result<Option<MatchRecord>, ReconError>;

    /// Mark a record deleted and return it. Second call → `AlreadyDeleted`.
    fn soft_delete(&self, match_id: &Uuid, actor: &str, at: DateTime<Utc>) -> Result<MatchRecord, ReconError>;

    fn active_for_item(&self, item_id: &str) -> Result<Option<MatchRecord>, ReconError>;

    /// All records, deleted included, in insertion order.
    fn records(&self) -> Result<Vec<MatchRecord>, ReconError>;
}

// ---------------------------------------------------------------------------
// In-memory item store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryItemStore {
    items: RwLock<BTreeMap<String, MatchableItem>>,
}

impl MemoryItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = MatchableItem>) -> Result<Self, ReconError> {
        let store = Self::new();
        for item in items {
            store.insert(item)?;
        }
        Ok(store)
    }

    pub fn insert(&self, item: MatchableItem) -> Result<(), ReconError> {
        let mut items = self.items.write();
        if items.contains_key(&item.id) {
            return Err(ReconError::Storage(format!("duplicate item id '{}'", item.id)));
        }
        items.insert(item.id.clone(), item);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

impl ItemStore for MemoryItemStore {
    fn get(&self, item_id: &str) -> Result<Option<MatchableItem>, ReconError> {
        Ok(self.items.read().get(item_id).cloned())
    }

    fn load_unmatched(&self, source_id: &str, range: Option<DateRange>) -> Result<Vec<MatchableItem>, ReconError> {
        let items = self.items.read();
        let mut known = false;
        let mut out = Vec::new();
        for item in items.values().filter(|i| i.source_id == source_id) {
            known = true;
            if item.status != ItemStatus::Unmatched {
                continue;
            }
            if range.map_or(true, |r| r.contains(item.date)) {
                out.push(item.clone());
            }
        }
        if !known {
            return Err(ReconError::not_found("source", source_id));
        }
        Ok(out)
    }

    fn compare_and_set(&self, item_ids: &[String], from: ItemStatus, to: ItemStatus) -> Result<(), ReconError> {
        let mut items = self.items.write();

        // Verify everything before touching anything
        for id in item_ids {
            let item = items.get(id).ok_or_else(|| ReconError::not_found("item", id.as_str()))?;
            if item.status != from {
                return Err(ReconError::StatusConflict {
                    item_id: id.clone(),
                    expected: from,
                    found: item.status,
                });
            }
        }

        for id in item_ids {
            if let Some(item) = items.get_mut(id) {
                item.status = to;
            }
        }
        Ok(())
    }

    fn status_counts(&self) -> Result<BTreeMap<ItemStatus, usize>, ReconError> {
        let mut counts = BTreeMap::new();
        for item in self.items.read().values() {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// In-memory ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LedgerState {
    records: Vec<MatchRecord>,
    by_id: HashMap<Uuid, usize>,
    active: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryMatchLedger {
    state: RwLock<LedgerState>,
}

impl MemoryMatchLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MatchLedger for MemoryMatchLedger {
    fn insert(&self, record: MatchRecord) -> Result<(), ReconError> {
        let mut state = self.state.write();
        if state.by_id.contains_key(&record.id) {
            return Err(ReconError::Storage(format!("duplicate match id '{}'", record.id)));
        }
        let members = record.group.member_ids();
        if let Some(taken) = members.iter().find(|id| state.active.contains_key(*id)) {
            return Err(ReconError::already_linked(taken.as_str()));
        }
        if record.is_active() {
            for id in members {
                state.active.insert(id, record.id);
            }
        }
        let idx = state.records.len();
        state.by_id.insert(record.id, idx);
        state.records.push(record);
        Ok(())
    }

    fn get(&self, match_id: &Uuid) -> Result<Option<MatchRecord>, ReconError> {
        let state = self.state.read();
        Ok(state.by_id.get(match_id).map(|&idx| state.records[idx].clone()))
    }

    fn soft_delete(&self, match_id: &Uuid, actor: &str, at: DateTime<Utc>) -> Result<MatchRecord, ReconError> {
        let mut state = self.state.write();
        let idx = *state
            .by_id
            .get(match_id)
            .ok_or_else(|| ReconError::not_found("match", match_id.to_string()))?;

        let record = &mut state.records[idx];
        if !record.is_active() {
            return Err(ReconError::AlreadyDeleted { match_id: match_id.to_string() });
        }
        record.deleted_at = Some(at);
        record.deleted_by = Some(actor.to_string());
        let updated = record.clone();

        for id in updated.group.member_ids() {
            if state.active.get(&id) == Some(match_id) {
                state.active.remove(&id);
            }
        }
        Ok(updated)
    }

    fn active_for_item(&self, item_id: &str) -> Result<Option<MatchRecord>, ReconError> {
        let state = self.state.read();
        Ok(state
            .active
            .get(item_id)
            .and_then(|id| state.by_id.get(id))
            .map(|&idx| state.records[idx].clone()))
    }

    fn records(&self) -> Result<Vec<MatchRecord>, ReconError> {
        Ok(self.state.read().records.clone())
    }
}
