//! The reconciler: candidate search, bulk runs, manual matches and unlink.
//!
//! Every match creation goes through one claim path (`commit`): an
//! all-or-nothing compare-and-set of every member from `unmatched` to
//! `matched`, then the ledger insert, then the audit entry. The ledger
//! insert is rolled back on failure; the audit entry is not, a failed
//! append is logged and counted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditSink};
use crate::blocking::BlockingIndex;
use crate::cache::CandidateCache;
use crate::classify::DecisionClassifier;
use crate::comparator::SharedComparator;
use crate::config::{amount_allowance, ReconConfig};
use crate::error::ReconError;
use crate::model::{
    BulkReport, DateRange, DecisionTier, DetectionMethod, ItemStatus, MatchCandidate, MatchGroup,
    MatchRecord, MatchableItem, ReconStats, Suggestion,
};
use crate::scoring::FeatureScorer;
use crate::store::{ItemStore, MatchLedger};

/// Actor recorded on auto-created matches unless the request names one.
pub const SYSTEM_ACTOR: &str = "system";

// ---------------------------------------------------------------------------
// Requests + cancellation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub source_a: String,
    pub source_b: String,
    pub auto_accept: bool,
    pub actor: String,
}

impl BulkRequest {
    pub fn new(source_a: &str, source_b: &str) -> Self {
        Self {
            source_a: source_a.to_string(),
            source_b: source_b.to_string(),
            auto_accept: false,
            actor: SYSTEM_ACTOR.to_string(),
        }
    }

    pub fn auto_accept(mut self, auto_accept: bool) -> Self {
        self.auto_accept = auto_accept;
        self
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }
}

/// Shared stop signal for a bulk run, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Counters {
    bulk_runs: AtomicU64,
    auto_linked: AtomicU64,
    manual_created: AtomicU64,
    unlinked: AtomicU64,
    item_errors: AtomicU64,
    audit_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

pub struct Reconciler {
    config: ReconConfig,
    scorer: FeatureScorer,
    classifier: DecisionClassifier,
    store: Arc<dyn ItemStore>,
    ledger: Arc<dyn MatchLedger>,
    audit: Arc<dyn AuditSink>,
    cache: CandidateCache,
    counters: Counters,
}

impl Reconciler {
    /// Validate `config` against `comparators` and wire the engine.
    /// Any configuration problem fails here, before an item is touched.
    pub fn new(
        config: ReconConfig,
        comparators: Vec<SharedComparator>,
        store: Arc<dyn ItemStore>,
        ledger: Arc<dyn MatchLedger>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ReconError> {
        config.validate()?;
        let weights = config.resolve_weights(&comparators)?;
        let scorer = FeatureScorer::new(
            config.tolerance,
            config.matching.require_opposite_sign,
            weights,
            comparators,
        );
        let classifier = DecisionClassifier::new(config.thresholds);
        let cache = CandidateCache::new(&config.cache);

        info!(
            "reconciler '{}' ready: {} comparator(s), cache {}",
            config.name,
            scorer.comparators().len(),
            if cache.is_enabled() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            scorer,
            classifier,
            store,
            ledger,
            audit,
            cache,
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Candidate search
    // -----------------------------------------------------------------------

    /// Ranked candidates for `item_id` among the unmatched items of
    /// `pool_source`, best first, at most `max_candidates`.
    pub fn find_candidates(&self, item_id: &str, pool_source: &str) -> Result<Vec<MatchCandidate>, ReconError> {
        let item = self.require_item(item_id)?;
        ensure_unmatched(&item)?;

        if let Some(hit) = self.cache.get(item_id, pool_source) {
            if self.still_unmatched(&hit)? {
                debug!("candidates for '{item_id}' in '{pool_source}': cache hit");
                return Ok((*hit).clone());
            }
            debug!("candidates for '{item_id}' in '{pool_source}': cached list is stale");
            self.cache.invalidate(item_id, pool_source);
        }

        let generation = self.cache.generation();
        let window = self.config.blocking_window();
        let pool = self
            .store
            .load_unmatched(pool_source, Some(DateRange::around(item.date, window.date_days)))?;
        let index = BlockingIndex::build(&pool, window);
        let ranked = self.rank(&item, &index)?;

        debug!(
            "candidates for '{item_id}' in '{pool_source}': {} of {} pooled",
            ranked.len(),
            index.len()
        );
        self.cache.insert(item_id, pool_source, generation, Arc::new(ranked.clone()));
        Ok(ranked)
    }

    /// Cached lists can miss claims made directly against the store.
    fn still_unmatched(&self, candidates: &[MatchCandidate]) -> Result<bool, ReconError> {
        for candidate in candidates {
            match self.store.get(&candidate.item.id)? {
                Some(current) if current.status == ItemStatus::Unmatched => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn rank(&self, item: &MatchableItem, index: &BlockingIndex<'_>) -> Result<Vec<MatchCandidate>, ReconError> {
        let survivors = index.candidates(item, self.scorer.comparators())?;
        let min_confidence = self.config.matching.min_confidence;

        let mut ranked = Vec::with_capacity(survivors.len());
        for (candidate, scored) in self.scorer.score_all(item, &survivors) {
            let scored = scored?;
            if scored.confidence < min_confidence {
                continue;
            }
            ranked.push(MatchCandidate {
                item: candidate.clone(),
                confidence: scored.confidence,
                features: scored.features,
                tier: self.classifier.classify(scored.confidence),
            });
        }

        ranked.sort_by(|a, b| {
            OrderedFloat(b.confidence)
                .cmp(&OrderedFloat(a.confidence))
                .then_with(|| a.item.id.cmp(&b.item.id))
        });
        ranked.truncate(self.config.matching.max_candidates);
        Ok(ranked)
    }

    // -----------------------------------------------------------------------
    // Bulk
    // -----------------------------------------------------------------------

    /// Match every unmatched `source_a` item against `source_b`, in batches
    /// of `matching.batch_size`. Per-item failures are counted in the report.
    pub fn bulk_reconcile(&self, request: &BulkRequest, cancel: &CancelFlag) -> Result<BulkReport, ReconError> {
        if request.source_a == request.source_b {
            return Err(ReconError::InvalidGroup(format!(
                "bulk run needs two different sources, got '{}' twice",
                request.source_a
            )));
        }

        let started = Instant::now();
        let items = self.store.load_unmatched(&request.source_a, None)?;
        let pool = self.store.load_unmatched(&request.source_b, None)?;
        let index = BlockingIndex::build(&pool, self.config.blocking_window());
        bump(&self.counters.bulk_runs);

        info!(
            "bulk '{}' -> '{}': {} item(s) against {} candidate(s), auto_accept={}",
            request.source_a,
            request.source_b,
            items.len(),
            index.len(),
            request.auto_accept
        );

        let mut report = BulkReport {
            source_a: request.source_a.clone(),
            source_b: request.source_b.clone(),
            ..BulkReport::default()
        };
        let mut claimed: HashSet<String> = HashSet::new();

        for batch in items.chunks(self.config.matching.batch_size) {
            if cancel.is_cancelled() {
                info!("bulk '{}': cancelled after {} batch(es)", request.source_a, report.batches);
                report.cancelled = true;
                break;
            }

            let ranked: Vec<Result<Vec<MatchCandidate>, ReconError>> =
                batch.par_iter().map(|item| self.rank(item, &index)).collect();

            for (item, result) in batch.iter().zip(ranked) {
                report.processed += 1;
                let outcome = result
                    .and_then(|candidates| self.settle(item, candidates, request, &mut claimed, &mut report));
                if let Err(e) = outcome {
                    report.errors += 1;
                    bump(&self.counters.item_errors);
                    warn!("bulk: item '{}' failed: {e}", item.id);
                }
            }
            report.batches += 1;
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        let secs = elapsed.as_secs_f64();
        report.items_per_sec = if secs > 0.0 { report.processed as f64 / secs } else { 0.0 };

        info!(
            "bulk '{}' -> '{}': processed {}, linked {}, suggested {}, conflicts {}, errors {} in {} ms",
            report.source_a,
            report.source_b,
            report.processed,
            report.linked,
            report.suggestions.len(),
            report.conflicts,
            report.errors,
            report.elapsed_ms
        );
        Ok(report)
    }

    /// Decide one bulk item: auto-link its best available candidate or
    /// record it as a suggestion. A candidate whose claim is lost, earlier
    /// in this run or to another writer, hands over to the next one.
    fn settle(
        &self,
        item: &MatchableItem,
        candidates: Vec<MatchCandidate>,
        request: &BulkRequest,
        claimed: &mut HashSet<String>,
        report: &mut BulkReport,
    ) -> Result<(), ReconError> {
        let had_candidates = !candidates.is_empty();

        for candidate in candidates {
            if claimed.contains(&candidate.item.id) {
                continue;
            }
            debug!(
                "bulk: '{}' -> '{}' confidence {:.4} ({})",
                item.id, candidate.item.id, candidate.confidence, candidate.tier
            );

            if candidate.tier == DecisionTier::AutoLink && request.auto_accept {
                let group = MatchGroup::Pairwise {
                    left: item.id.clone(),
                    right: candidate.item.id.clone(),
                };
                match self.commit(MatchRecord::auto(group, candidate.confidence, &request.actor)) {
                    Ok(record) => {
                        claimed.insert(candidate.item.id.clone());
                        report.linked += 1;
                        report.linked_ids.push(record.id);
                        bump(&self.counters.auto_linked);
                    }
                    Err(ReconError::AlreadyLinked { item_id } | ReconError::IneligibleItem { item_id, .. })
                        if item_id == candidate.item.id =>
                    {
                        debug!("bulk: '{item_id}' claimed outside this run, trying next candidate");
                        claimed.insert(item_id);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else if candidate.tier > DecisionTier::NoMatch {
                report.suggestions.push(Suggestion {
                    item_id: item.id.clone(),
                    candidate_id: candidate.item.id.clone(),
                    confidence: candidate.confidence,
                    tier: candidate.tier,
                });
            }
            report.tiers.record(candidate.tier);
            return Ok(());
        }

        if had_candidates {
            report.conflicts += 1;
            debug!("bulk: '{}' lost every candidate to other claims", item.id);
        }
        report.tiers.record(DecisionTier::NoMatch);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Manual matches
    // -----------------------------------------------------------------------

    pub fn reconcile_pair(
        &self,
        left: &str,
        right: &str,
        actor: &str,
        reason: Option<String>,
    ) -> Result<MatchRecord, ReconError> {
        let group = MatchGroup::Pairwise {
            left: left.to_string(),
            right: right.to_string(),
        };
        self.reconcile_group(group, actor, reason)
    }

    /// Persist a manual match after shape, existence, status, owner and
    /// (for 1:N / N:1) amount-sum checks.
    pub fn reconcile_group(
        &self,
        group: MatchGroup,
        actor: &str,
        reason: Option<String>,
    ) -> Result<MatchRecord, ReconError> {
        check_shape(&group)?;

        let mut members = Vec::new();
        for id in group.member_ids() {
            members.push(self.require_item(&id)?);
        }
        for item in &members {
            ensure_unmatched(item)?;
        }
        if let Some((first, rest)) = members.split_first() {
            for item in rest {
                if item.owner != first.owner {
                    return Err(ReconError::OwnerMismatch {
                        item_id: item.id.clone(),
                        expected: first.owner.clone(),
                        found: item.owner.clone(),
                    });
                }
            }
        }
        if let Some((one, many)) = group.one_and_many() {
            self.check_sum(one, many, &members)?;
        }

        let record = self.commit(MatchRecord::manual(group, actor, reason))?;
        bump(&self.counters.manual_created);
        Ok(record)
    }

    fn check_sum(&self, one: &str, many: &[String], members: &[MatchableItem]) -> Result<(), ReconError> {
        let amounts: HashMap<&str, u64> = members
            .iter()
            .map(|m| (m.id.as_str(), m.amount_minor.unsigned_abs()))
            .collect();
        let lookup = |id: &str| amounts.get(id).copied().ok_or_else(|| ReconError::not_found("item", id));

        let expected = lookup(one)?;
        let mut actual: u64 = 0;
        for id in many {
            actual = actual
                .checked_add(lookup(id)?)
                .ok_or_else(|| ReconError::InvalidGroup("many-side amount overflows".into()))?;
        }

        let allowed = amount_allowance(expected, self.config.tolerance.amount_pct);
        let delta = actual as i128 - expected as i128;
        if delta.unsigned_abs() > allowed as u128 {
            return Err(ReconError::CardinalityMismatch {
                expected: saturate(expected as i128),
                actual: saturate(actual as i128),
                delta: saturate(delta),
                allowed,
            });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Claim path
    // -----------------------------------------------------------------------

    fn commit(&self, record: MatchRecord) -> Result<MatchRecord, ReconError> {
        let members = record.group.member_ids();

        self.store
            .compare_and_set(&members, ItemStatus::Unmatched, ItemStatus::Matched)
            .map_err(|e| match e {
                ReconError::StatusConflict { item_id, found: ItemStatus::Matched, .. } => {
                    ReconError::AlreadyLinked { item_id }
                }
                ReconError::StatusConflict { item_id, found, .. } => {
                    ReconError::IneligibleItem { item_id, status: found }
                }
                other => other,
            })?;

        if let Err(e) = self.ledger.insert(record.clone()) {
            if let Err(rollback) = self
                .store
                .compare_and_set(&members, ItemStatus::Matched, ItemStatus::Unmatched)
            {
                error!("match {}: status rollback failed after ledger error: {rollback}", record.id);
            }
            return Err(e);
        }

        self.append_audit(&AuditEvent::created(&record));
        self.cache.invalidate_all();

        info!(
            "match {} created ({}, {} member(s)) by {}",
            record.id,
            record.detection_method,
            members.len(),
            record.created_by
        );
        Ok(record)
    }

    fn append_audit(&self, event: &AuditEvent) {
        if let Err(e) = self.audit.append(event) {
            bump(&self.counters.audit_failures);
            error!("audit append failed for match {}: {e}", event.match_id);
        }
    }

    // -----------------------------------------------------------------------
    // Unlink
    // -----------------------------------------------------------------------

    /// Soft-delete a match and return every member to `unmatched`.
    pub fn unlink(&self, match_id: &Uuid, actor: &str, reason: Option<String>) -> Result<MatchRecord, ReconError> {
        let at = Utc::now();
        let record = self.ledger.soft_delete(match_id, actor, at)?;
        let members = record.group.member_ids();

        self.store
            .compare_and_set(&members, ItemStatus::Matched, ItemStatus::Unmatched)
            .map_err(|e| {
                error!("match {match_id}: soft-deleted but member reset failed: {e}");
                ReconError::Storage(format!("match {match_id} unlinked but member reset failed: {e}"))
            })?;

        self.append_audit(&AuditEvent::unlinked(&record, actor, reason, at));
        self.cache.invalidate_all();
        bump(&self.counters.unlinked);

        info!("match {match_id} unlinked by {actor}");
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Stats
    // -----------------------------------------------------------------------

    pub fn get_stats(&self) -> Result<ReconStats, ReconError> {
        let mut stats = ReconStats {
            items_by_status: self.store.status_counts()?,
            ..ReconStats::default()
        };

        for record in self.ledger.records()? {
            if record.is_active() {
                stats.active_matches += 1;
            } else {
                stats.unlinked_matches += 1;
            }
            match record.detection_method {
                DetectionMethod::Auto => stats.auto_matches += 1,
                DetectionMethod::Manual => stats.manual_matches += 1,
            }
        }

        let c = &self.counters;
        stats.bulk_runs = c.bulk_runs.load(Ordering::Relaxed);
        stats.auto_linked = c.auto_linked.load(Ordering::Relaxed);
        stats.manual_created = c.manual_created.load(Ordering::Relaxed);
        stats.unlinked = c.unlinked.load(Ordering::Relaxed);
        stats.item_errors = c.item_errors.load(Ordering::Relaxed);
        stats.audit_failures = c.audit_failures.load(Ordering::Relaxed);
        Ok(stats)
    }

    fn require_item(&self, item_id: &str) -> Result<MatchableItem, ReconError> {
        self.store
            .get(item_id)?
            .ok_or_else(|| ReconError::not_found("item", item_id))
    }
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

fn ensure_unmatched(item: &MatchableItem) -> Result<(), ReconError> {
    match item.status {
        ItemStatus::Unmatched => Ok(()),
        ItemStatus::Matched => Err(ReconError::already_linked(item.id.as_str())),
        status => Err(ReconError::IneligibleItem {
            item_id: item.id.clone(),
            status,
        }),
    }
}

fn check_shape(group: &MatchGroup) -> Result<(), ReconError> {
    if let Some((_, many)) = group.one_and_many() {
        if many.is_empty() {
            return Err(ReconError::InvalidGroup("many side is empty".into()));
        }
    }
    let ids = group.member_ids();
    if ids.iter().any(|id| id.is_empty()) {
        return Err(ReconError::InvalidGroup("empty item id".into()));
    }
    let mut seen = HashSet::new();
    for id in &ids {
        if !seen.insert(id.as_str()) {
            return Err(ReconError::InvalidGroup(format!("item '{id}' appears more than once")));
        }
    }
    Ok(())
}

fn saturate(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditAction, MemoryAuditLog};
    use crate::comparator::{build_comparators, ExactComparator, FieldComparator, FnComparator};
    use crate::store::{MemoryItemStore, MemoryMatchLedger};
    use chrono::NaiveDate;
    use std::sync::Barrier;

    const CONFIG: &str = r#"
name = "unit"

[tolerance]
amount_pct = 1.0
date_days = 5

[weights]
amount = 0.5
date = 0.4
payee = 0.1

[thresholds]
manual = 0.5
suggest = 0.7
auto_link = 0.9

[matching]
require_opposite_sign = true
batch_size = 2

[[comparators]]
name = "payee"
kind = "text"
field = "label"
"#;

    fn item(id: &str, source: &str, amount: i64, day: u32, label: &str) -> MatchableItem {
        MatchableItem {
            id: id.into(),
            source_id: source.into(),
            owner: "acme".into(),
            amount_minor: amount,
            date: NaiveDate::from_ymd_opt(2026, 3, day).unwrap(),
            label: label.into(),
            attributes: HashMap::new(),
            status: ItemStatus::Unmatched,
        }
    }

    struct Harness {
        recon: Reconciler,
        store: Arc<MemoryItemStore>,
        audit: Arc<MemoryAuditLog>,
    }

    fn harness_with(config: &str, items: Vec<MatchableItem>) -> Harness {
        let config = ReconConfig::from_toml(config).unwrap();
        let comparators = build_comparators(&config.comparators, &config.similarity);
        let store = Arc::new(MemoryItemStore::with_items(items).unwrap());
        let audit = Arc::new(MemoryAuditLog::new());
        let recon = Reconciler::new(
            config,
            comparators,
            store.clone(),
            Arc::new(MemoryMatchLedger::new()),
            audit.clone(),
        )
        .unwrap();
        Harness { recon, store, audit }
    }

    fn harness(items: Vec<MatchableItem>) -> Harness {
        harness_with(CONFIG, items)
    }

    /// `config` must carry a weight for `extra`.
    fn harness_with_extra(config: &str, store: Arc<MemoryItemStore>, extra: SharedComparator) -> Harness {
        let config = ReconConfig::from_toml(config).unwrap();
        let mut comparators = build_comparators(&config.comparators, &config.similarity);
        comparators.push(extra);
        let audit = Arc::new(MemoryAuditLog::new());
        let recon = Reconciler::new(
            config,
            comparators,
            store.clone(),
            Arc::new(MemoryMatchLedger::new()),
            audit.clone(),
        )
        .unwrap();
        Harness { recon, store, audit }
    }

    fn status(h: &Harness, id: &str) -> ItemStatus {
        h.store.get(id).unwrap().unwrap().status
    }

    #[test]
    fn config_rejected_at_construction() {
        let mut config = ReconConfig::from_toml(CONFIG).unwrap();
        let comparators = build_comparators(&config.comparators, &config.similarity);
        config.weights.insert("amount".into(), 0.9);
        let result = Reconciler::new(
            config,
            comparators,
            Arc::new(MemoryItemStore::new()),
            Arc::new(MemoryMatchLedger::new()),
            Arc::new(MemoryAuditLog::new()),
        );
        assert!(matches!(result, Err(ReconError::Configuration(_))));
    }

    #[test]
    fn candidates_ranked_and_tiered() {
        let h = harness(vec![
            item("a1", "bank", -10_000, 10, "ACME CORP"),
            item("b1", "ledger", 10_000, 10, "ACME CORP"),
            item("b2", "ledger", 10_050, 12, "ACME CORPORATION"),
            item("b3", "ledger", 10_000, 30, "ACME CORP"),
            item("b4", "ledger", 50_000, 10, "ACME CORP"),
        ]);
        let found = h.recon.find_candidates("a1", "ledger").unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.item.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
        assert_eq!(found[0].tier, DecisionTier::AutoLink);
        assert!(found[0].confidence >= found[1].confidence);
        assert!(found[1].features.contains_key("payee"));
    }

    #[test]
    fn candidates_truncated_and_tied_by_id() {
        let config = CONFIG.replace("batch_size = 2", "batch_size = 2\nmax_candidates = 2");
        let h = harness_with(&config, vec![
            item("a1", "bank", -500, 5, "X"),
            item("c", "ledger", 500, 5, "X"),
            item("b", "ledger", 500, 5, "X"),
            item("a", "ledger", 500, 5, "X"),
        ]);
        let found = h.recon.find_candidates("a1", "ledger").unwrap();
        let ids: Vec<&str> = found.iter().map(|c| c.item.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn candidates_for_unknown_or_linked_item() {
        let h = harness(vec![item("a1", "bank", -100, 1, ""), item("b1", "ledger", 100, 1, "")]);
        assert!(matches!(
            h.recon.find_candidates("nope", "ledger"),
            Err(ReconError::NotFound { kind: "item", .. })
        ));
        assert!(matches!(
            h.recon.find_candidates("a1", "elsewhere"),
            Err(ReconError::NotFound { kind: "source", .. })
        ));
        h.recon.reconcile_pair("a1", "b1", "alice", None).unwrap();
        assert_eq!(
            h.recon.find_candidates("a1", "ledger").unwrap_err(),
            ReconError::already_linked("a1")
        );
    }

    #[test]
    fn cached_candidates_invalidated_by_commit() {
        let h = harness(vec![
            item("a1", "bank", -100, 1, "P"),
            item("a2", "bank", -100, 1, "P"),
            item("b1", "ledger", 100, 1, "P"),
            item("b2", "ledger", 100, 2, "P"),
        ]);
        assert_eq!(h.recon.find_candidates("a1", "ledger").unwrap().len(), 2);
        h.recon.reconcile_pair("a2", "b1", "alice", None).unwrap();
        let after = h.recon.find_candidates("a1", "ledger").unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].item.id, "b2");
    }

    #[test]
    fn cached_candidates_drop_items_claimed_in_store() {
        let h = harness(vec![
            item("a1", "bank", -100, 1, "P"),
            item("b1", "ledger", 100, 1, "P"),
            item("b2", "ledger", 100, 2, "P"),
        ]);
        let first = h.recon.find_candidates("a1", "ledger").unwrap();
        assert_eq!(first[0].item.id, "b1");

        // Another worker claims b1 straight through the shared store
        h.store
            .compare_and_set(&["b1".to_string()], ItemStatus::Unmatched, ItemStatus::Matched)
            .unwrap();

        let second = h.recon.find_candidates("a1", "ledger").unwrap();
        let ids: Vec<&str> = second.iter().map(|c| c.item.id.as_str()).collect();
        assert_eq!(ids, vec!["b2"]);
        assert!(second.iter().all(|c| c.item.status == ItemStatus::Unmatched));
    }

    #[test]
    fn huge_date_window_clamps_instead_of_overflowing() {
        let config = CONFIG.replace("date_days = 5", "date_days = 200000000");
        let h = harness_with(&config, vec![
            item("a1", "bank", -100, 1, "P"),
            item("b1", "ledger", 100, 28, "P"),
        ]);
        let found = h.recon.find_candidates("a1", "ledger").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].item.id, "b1");
    }

    #[test]
    fn fractional_tolerance_boundary_is_inclusive() {
        // 0.57% of 10_000 allows exactly 57
        let config = CONFIG.replace("amount_pct = 1.0", "amount_pct = 0.57");
        let h = harness_with(&config, vec![
            item("a1", "bank", -10_000, 1, "P"),
            item("edge", "ledger", 10_057, 1, "P"),
            item("inv", "ledger", 10_000, 1, ""),
            item("p1", "bank", -5_000, 1, ""),
            item("p2", "bank", -5_057, 1, ""),
        ]);

        let found = h.recon.find_candidates("a1", "ledger").unwrap();
        assert!(found.iter().any(|c| c.item.id == "edge"));

        let record = h
            .recon
            .reconcile_group(
                MatchGroup::OneToMany { one: "inv".into(), many: vec!["p1".into(), "p2".into()] },
                "u",
                None,
            )
            .unwrap();
        assert_eq!(record.group.member_ids().len(), 3);
        assert_eq!(status(&h, "p2"), ItemStatus::Matched);
    }

    #[test]
    fn manual_pair_persists_without_confidence() {
        let h = harness(vec![item("a1", "bank", -100, 1, ""), item("b1", "ledger", 100, 1, "")]);
        let record = h.recon.reconcile_pair("a1", "b1", "alice", Some("same invoice".into())).unwrap();
        assert_eq!(record.detection_method, DetectionMethod::Manual);
        assert!(record.confidence.is_none());
        assert_eq!(status(&h, "a1"), ItemStatus::Matched);
        assert_eq!(status(&h, "b1"), ItemStatus::Matched);

        let events = h.audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "alice");
        assert_eq!(events[0].reason.as_deref(), Some("same invoice"));
    }

    #[test]
    fn manual_validation_failures() {
        let mut other = item("o1", "ledger", 100, 1, "");
        other.owner = "globex".into();
        let mut excluded = item("x1", "ledger", 100, 1, "");
        excluded.status = ItemStatus::Excluded;
        let h = harness(vec![item("a1", "bank", -100, 1, ""), other, excluded]);

        assert!(matches!(
            h.recon.reconcile_pair("a1", "a1", "u", None),
            Err(ReconError::InvalidGroup(_))
        ));
        assert!(matches!(
            h.recon.reconcile_pair("a1", "zz", "u", None),
            Err(ReconError::NotFound { .. })
        ));
        assert!(matches!(
            h.recon.reconcile_pair("a1", "o1", "u", None),
            Err(ReconError::OwnerMismatch { .. })
        ));
        assert!(matches!(
            h.recon.reconcile_pair("a1", "x1", "u", None),
            Err(ReconError::IneligibleItem { status: ItemStatus::Excluded, .. })
        ));
        assert!(matches!(
            h.recon.reconcile_group(
                MatchGroup::OneToMany { one: "a1".into(), many: vec![] },
                "u",
                None
            ),
            Err(ReconError::InvalidGroup(_))
        ));
        assert_eq!(status(&h, "a1"), ItemStatus::Unmatched);
        assert!(h.audit.events().is_empty());
    }

    #[test]
    fn group_sum_boundary() {
        // 1% of 10_000 allows 100
        let h = harness(vec![
            item("inv", "ledger", 10_000, 1, ""),
            item("p1", "bank", -6_000, 1, ""),
            item("p2", "bank", -4_100, 2, ""),
            item("q1", "bank", -6_000, 1, ""),
            item("q2", "bank", -4_101, 2, ""),
            item("inv2", "ledger", 10_000, 1, ""),
        ]);

        let err = h
            .recon
            .reconcile_group(
                MatchGroup::OneToMany { one: "inv".into(), many: vec!["q1".into(), "q2".into()] },
                "u",
                None,
            )
            .unwrap_err();
        assert_eq!(
            err,
            ReconError::CardinalityMismatch { expected: 10_000, actual: 10_101, delta: 101, allowed: 100 }
        );

        let record = h
            .recon
            .reconcile_group(
                MatchGroup::ManyToOne { many: vec!["p1".into(), "p2".into()], one: "inv2".into() },
                "u",
                None,
            )
            .unwrap();
        assert_eq!(record.group.member_ids().len(), 3);
        assert_eq!(status(&h, "p2"), ItemStatus::Matched);
        assert_eq!(status(&h, "inv"), ItemStatus::Unmatched);
    }

    #[test]
    fn unlink_restores_eligibility() {
        let h = harness(vec![item("a1", "bank", -100, 1, "P"), item("b1", "ledger", 100, 1, "P")]);
        let record = h.recon.reconcile_pair("a1", "b1", "alice", None).unwrap();
        assert!(h.recon.find_candidates("a1", "ledger").is_err());

        let unlinked = h.recon.unlink(&record.id, "bob", Some("wrong".into())).unwrap();
        assert_eq!(unlinked.deleted_by.as_deref(), Some("bob"));
        assert_eq!(status(&h, "a1"), ItemStatus::Unmatched);
        assert_eq!(status(&h, "b1"), ItemStatus::Unmatched);

        let found = h.recon.find_candidates("a1", "ledger").unwrap();
        assert_eq!(found[0].item.id, "b1");

        assert!(matches!(
            h.recon.unlink(&record.id, "bob", None),
            Err(ReconError::AlreadyDeleted { .. })
        ));
        let events = h.audit.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].action, AuditAction::MatchUnlinked);

        let stats = h.recon.get_stats().unwrap();
        assert_eq!(stats.active_matches, 0);
        assert_eq!(stats.unlinked_matches, 1);
        assert_eq!(stats.manual_created, 1);
        assert_eq!(stats.unlinked, 1);
    }

    #[test]
    fn concurrent_claims_yield_one_winner() {
        for _ in 0..20 {
            let h = harness(vec![
                item("a", "bank", -100, 1, ""),
                item("b", "ledger", 100, 1, ""),
                item("c", "ledger", 100, 1, ""),
            ]);
            let barrier = Barrier::new(2);
            let results: Vec<Result<MatchRecord, ReconError>> = std::thread::scope(|s| {
                let handles: Vec<_> = ["b", "c"]
                    .into_iter()
                    .map(|partner| {
                        let recon = &h.recon;
                        let barrier = &barrier;
                        s.spawn(move || {
                            barrier.wait();
                            recon.reconcile_pair("a", partner, "worker", None)
                        })
                    })
                    .collect();
                handles.into_iter().map(|j| j.join().unwrap()).collect()
            });

            let wins = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(wins, 1);
            let loss = results.into_iter().find_map(|r| r.err()).unwrap();
            assert_eq!(loss, ReconError::already_linked("a"));

            let matched: Vec<ItemStatus> = ["b", "c"].iter().map(|id| status(&h, id)).collect();
            assert_eq!(matched.iter().filter(|s| **s == ItemStatus::Matched).count(), 1);
        }
    }

    #[test]
    fn bulk_auto_links_and_suggests() {
        let h = harness(vec![
            item("a1", "bank", -10_000, 10, "ACME"),
            item("a2", "bank", -20_000, 11, "GLOBEX"),
            item("a3", "bank", -30_000, 12, "INITECH"),
            item("a4", "bank", -40_000, 13, "HOOLI"),
            item("a5", "bank", -10_000, 10, "ACME"),
            item("b1", "ledger", 10_000, 10, "ACME"),
            item("b2", "ledger", 20_000, 14, "GLOBEX LTD"),
            item("b3", "ledger", 30_000, 15, "UMBRELLA"),
        ]);
        let report = h
            .recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger").auto_accept(true), &CancelFlag::new())
            .unwrap();

        assert_eq!(report.processed, 5);
        assert_eq!(report.batches, 3);
        assert_eq!(report.linked, 1);
        assert_eq!(report.errors, 0);
        // a5 wanted b1 too
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.tiers.total(), 5);
        assert_eq!(status(&h, "a1"), ItemStatus::Matched);
        assert_eq!(status(&h, "b1"), ItemStatus::Matched);
        assert_eq!(status(&h, "a5"), ItemStatus::Unmatched);
        assert!(report.suggestions.iter().all(|s| s.tier != DecisionTier::NoMatch));
        assert!(report.suggestions.iter().any(|s| s.item_id == "a2" && s.candidate_id == "b2"));

        let stats = h.recon.get_stats().unwrap();
        assert_eq!(stats.auto_matches, 1);
        assert_eq!(stats.bulk_runs, 1);
        assert_eq!(stats.auto_linked, 1);

        let events = h.audit.events();
        assert_eq!(events[0].detection_method, DetectionMethod::Auto);
        let confidence = events[0].confidence.unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }

    #[test]
    fn bulk_without_auto_accept_only_suggests() {
        let h = harness(vec![item("a1", "bank", -100, 1, "P"), item("b1", "ledger", 100, 1, "P")]);
        let report = h
            .recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger"), &CancelFlag::new())
            .unwrap();
        assert_eq!(report.linked, 0);
        assert_eq!(report.tiers.auto_link, 1);
        assert_eq!(report.suggestions.len(), 1);
        assert_eq!(status(&h, "a1"), ItemStatus::Unmatched);
    }

    #[test]
    fn bulk_counts_item_failures() {
        let config = ReconConfig::from_toml(&CONFIG.replace("payee = 0.1", "payee = 0.05\nboom = 0.05")).unwrap();
        let mut comparators = build_comparators(&config.comparators, &config.similarity);
        let boom: SharedComparator = Arc::new(FnComparator::new("boom", 0.05, false, |a, _| {
            if a.label == "LONG" {
                Err(ReconError::LengthExceeded { len: 501, max: 500 })
            } else {
                Ok(1.0)
            }
        }));
        comparators.push(boom);
        let store = Arc::new(
            MemoryItemStore::with_items(vec![
                item("a1", "bank", -100, 1, "LONG"),
                item("a2", "bank", -200, 1, "P"),
                item("b1", "ledger", 100, 1, "P"),
                item("b2", "ledger", 200, 1, "P"),
            ])
            .unwrap(),
        );
        let recon = Reconciler::new(
            config,
            comparators,
            store.clone(),
            Arc::new(MemoryMatchLedger::new()),
            Arc::new(MemoryAuditLog::new()),
        )
        .unwrap();

        let report = recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger").auto_accept(true), &CancelFlag::new())
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.linked, 1);
        assert_eq!(recon.get_stats().unwrap().item_errors, 1);
    }

    #[test]
    fn cancelled_bulk_stops_before_first_batch() {
        let h = harness(vec![item("a1", "bank", -100, 1, "P"), item("b1", "ledger", 100, 1, "P")]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let report = h
            .recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger").auto_accept(true), &cancel)
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(status(&h, "a1"), ItemStatus::Unmatched);
    }

    #[test]
    fn bulk_falls_back_to_next_candidate_claimed_earlier_in_run() {
        let h = harness(vec![
            item("a1", "bank", -10_000, 10, "ACME"),
            item("a2", "bank", -10_000, 10, "ACME"),
            item("b1", "ledger", 10_000, 10, "ACME"),
            item("b2", "ledger", 10_000, 10, "ACME"),
        ]);
        let report = h
            .recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger").auto_accept(true), &CancelFlag::new())
            .unwrap();

        assert_eq!(report.linked, 2);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.tiers.auto_link, 2);
        for id in ["a1", "a2", "b1", "b2"] {
            assert_eq!(status(&h, id), ItemStatus::Matched, "{id}");
        }
    }

    #[test]
    fn bulk_falls_back_when_another_writer_claims_top_candidate() {
        let store = Arc::new(
            MemoryItemStore::with_items(vec![
                item("a1", "bank", -10_000, 10, "ACME"),
                item("b1", "ledger", 10_000, 10, "ACME"),
                item("b2", "ledger", 10_000, 10, "ACME"),
            ])
            .unwrap(),
        );
        let rival_store = store.clone();
        // Takes b1 while the batch is being ranked, after the pool was loaded
        let rival: SharedComparator = Arc::new(FnComparator::new("rival", 0.05, false, move |_, _| {
            let b1 = ["b1".to_string()];
            let _ = rival_store.compare_and_set(&b1, ItemStatus::Unmatched, ItemStatus::Matched);
            Ok(1.0)
        }));
        let config = CONFIG.replace("payee = 0.1", "payee = 0.05\nrival = 0.05");
        let h = harness_with_extra(&config, store, rival);

        let report = h
            .recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger").auto_accept(true), &CancelFlag::new())
            .unwrap();

        assert_eq!(report.linked, 1);
        assert_eq!(report.conflicts, 0);
        assert_eq!(report.errors, 0);
        assert_eq!(report.tiers.auto_link, 1);
        assert_eq!(status(&h, "a1"), ItemStatus::Matched);
        assert_eq!(status(&h, "b2"), ItemStatus::Matched);
        let events = h.audit.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].after.iter().any(|m| m.item_id == "b2"));
    }

    #[test]
    fn cancel_between_batches_keeps_committed_work() {
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        let stop: SharedComparator = Arc::new(FnComparator::new("stop", 0.05, false, move |a, _| {
            if a.id == "a3" {
                trigger.cancel();
            }
            Ok(1.0)
        }));
        let mut items = Vec::new();
        for i in 1..=5i64 {
            items.push(item(&format!("a{i}"), "bank", -100 * i, 1, "P"));
            items.push(item(&format!("b{i}"), "ledger", 100 * i, 1, "P"));
        }
        let store = Arc::new(MemoryItemStore::with_items(items).unwrap());
        let config = CONFIG.replace("payee = 0.1", "payee = 0.05\nstop = 0.05");
        let h = harness_with_extra(&config, store, stop);

        let report = h
            .recon
            .bulk_reconcile(&BulkRequest::new("bank", "ledger").auto_accept(true), &cancel)
            .unwrap();

        // batch_size = 2: a3 cancels during the second batch, the third never runs
        assert!(report.cancelled);
        assert_eq!(report.batches, 2);
        assert_eq!(report.processed, 4);
        assert_eq!(report.linked, 4);
        assert_eq!(status(&h, "a1"), ItemStatus::Matched);
        assert_eq!(status(&h, "a4"), ItemStatus::Matched);
        assert_eq!(status(&h, "a5"), ItemStatus::Unmatched);
        assert_eq!(h.recon.get_stats().unwrap().active_matches, 4);
    }

    #[test]
    fn blocking_partition_respected() {
        let currency: SharedComparator = Arc::new(ExactComparator::partition("currency"));
        assert!(currency.is_blocking());
        let config = ReconConfig::from_toml(CONFIG).unwrap();
        let mut comparators = build_comparators(&config.comparators, &config.similarity);
        comparators.push(currency);

        let mut a = item("a1", "bank", -100, 1, "P");
        a.attributes.insert("currency".into(), "EUR".into());
        let mut usd = item("b1", "ledger", 100, 1, "P");
        usd.attributes.insert("currency".into(), "USD".into());
        let mut eur = item("b2", "ledger", 100, 3, "Q");
        eur.attributes.insert("currency".into(), "EUR".into());

        let recon = Reconciler::new(
            config,
            comparators,
            Arc::new(MemoryItemStore::with_items(vec![a, usd, eur]).unwrap()),
            Arc::new(MemoryMatchLedger::new()),
            Arc::new(MemoryAuditLog::new()),
        )
        .unwrap();
        let found = recon.find_candidates("a1", "ledger").unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].item.id, "b2");
    }
}
