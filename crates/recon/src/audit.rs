//! Audit trail for match creation and unlink.

use std::io::Write;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ReconError;
use crate::model::{DetectionMethod, ItemStatus, MatchRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    MatchCreated,
    MatchUnlinked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberState {
    pub item_id: String,
    pub status: ItemStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub match_id: Uuid,
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub detection_method: DetectionMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub before: Vec<MemberState>,
    pub after: Vec<MemberState>,
    pub at: DateTime<Utc>,
}

fn members(record: &MatchRecord, status: ItemStatus) -> Vec<MemberState> {
    record
        .group
        .member_ids()
        .into_iter()
        .map(|item_id| MemberState { item_id, status })
        .collect()
}

impl AuditEvent {
    pub fn created(record: &MatchRecord) -> Self {
        Self {
            action: AuditAction::MatchCreated,
            match_id: record.id,
            actor: record.created_by.clone(),
            reason: record.reason.clone(),
            detection_method: record.detection_method,
            confidence: record.confidence,
            before: members(record, ItemStatus::Unmatched),
            after: members(record, ItemStatus::Matched),
            at: record.created_at,
        }
    }

    pub fn unlinked(record: &MatchRecord, actor: &str, reason: Option<String>, at: DateTime<Utc>) -> Self {
        Self {
            action: AuditAction::MatchUnlinked,
            match_id: record.id,
            actor: actor.to_string(),
            reason,
            detection_method: record.detection_method,
            confidence: record.confidence,
            before: members(record, ItemStatus::Matched),
            after: members(record, ItemStatus::Unmatched),
            at,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn append(&self, event: &AuditEvent) -> Result<(), ReconError>;
}

/// Keeps events in memory, in append order.
#[derive(Default)]
pub struct MemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, event: &AuditEvent) -> Result<(), ReconError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// One JSON object per line, flushed per event.
pub struct JsonlAuditSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonlAuditSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer: Mutex::new(writer) }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> AuditSink for JsonlAuditSink<W> {
    fn append(&self, event: &AuditEvent) -> Result<(), ReconError> {
        let line = serde_json::to_string(event).map_err(|e| ReconError::Io(e.to_string()))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}
