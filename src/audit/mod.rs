//! Session archive
//!
//! Closed sessions are kept with their tasks, final risk, metrics and full
//! event history, sealed with a SHA-256 digest so tampering can be detected.
//! Retention is bounded: past capacity the oldest archive entries go first.

use crate::models::{
    AggregateRisk, Event, EventPayload, Recommendation, Session, SessionId, SpecialistKind,
    SpecialistTask, TaskId, TaskStatus,
};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Archive entries kept when no capacity is configured
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 1000;

//
// ================= Metrics =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMetrics {
    pub task_id: TaskId,
    pub kind: SpecialistKind,
    pub status: TaskStatus,
    pub attempts: u32,
    /// Dispatch to terminal state; `None` while still active
    pub duration_ms: Option<i64>,
}

/// Per-session investigation metrics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvestigationMetrics {
    /// Session creation to its last event
    pub duration_ms: i64,
    pub agents_spawned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub cancelled: usize,
    pub patterns_matched: usize,
    pub risk_level: Option<Recommendation>,
    pub tasks: Vec<TaskMetrics>,
}

impl InvestigationMetrics {
    pub fn compute(
        session: &Session,
        tasks: &[SpecialistTask],
        final_risk: Option<&AggregateRisk>,
        events: &[Event],
    ) -> Self {
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

        let ended = events
            .last()
            .map(|e| e.timestamp)
            .unwrap_or(session.last_activity_at);

        let patterns_matched = events
            .iter()
            .map(|e| match &e.payload {
                EventPayload::PatternMatch { keys, .. } => keys.len(),
                _ => 0,
            })
            .sum();

        Self {
            duration_ms: (ended - session.created_at).num_milliseconds().max(0),
            agents_spawned: tasks.len(),
            succeeded: count(TaskStatus::Succeeded),
            failed: count(TaskStatus::Failed),
            timed_out: count(TaskStatus::TimedOut),
            cancelled: count(TaskStatus::Cancelled),
            patterns_matched,
            risk_level: final_risk.map(|r| r.recommendation),
            tasks: tasks
                .iter()
                .map(|t| TaskMetrics {
                    task_id: t.task_id,
                    kind: t.kind,
                    status: t.status,
                    attempts: t.attempts,
                    duration_ms: t
                        .ended_at
                        .map(|end| (end - t.dispatched_at).num_milliseconds().max(0)),
                })
                .collect(),
        }
    }
}

//
// ================= Archive =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSession {
    pub session: Session,
    pub tasks: Vec<SpecialistTask>,
    pub final_risk: Option<AggregateRisk>,
    pub events: Vec<Event>,
    pub metrics: InvestigationMetrics,
    pub archived_at: DateTime<Utc>,
    pub digest: String,
}

/// Everything covered by the digest
#[derive(Serialize)]
struct SealedContent<'a> {
    session: &'a Session,
    tasks: &'a [SpecialistTask],
    final_risk: &'a Option<AggregateRisk>,
    events: &'a [Event],
    metrics: &'a InvestigationMetrics,
}

impl ArchivedSession {
    pub fn seal(
        session: Session,
        tasks: Vec<SpecialistTask>,
        final_risk: Option<AggregateRisk>,
        events: Vec<Event>,
    ) -> Self {
        let metrics = InvestigationMetrics::compute(&session, &tasks, final_risk.as_ref(), &events);
        let digest = compute_digest(&SealedContent {
            session: &session,
            tasks: &tasks,
            final_risk: &final_risk,
            events: &events,
            metrics: &metrics,
        });

        Self {
            session,
            tasks,
            final_risk,
            events,
            metrics,
            archived_at: Utc::now(),
            digest,
        }
    }

    pub fn recompute_digest(&self) -> String {
        compute_digest(&SealedContent {
            session: &self.session,
            tasks: &self.tasks,
            final_risk: &self.final_risk,
            events: &self.events,
            metrics: &self.metrics,
        })
    }
}

/// Archive storage
pub struct SessionArchive {
    records: Arc<RwLock<HashMap<SessionId, ArchivedSession>>>,
    capacity: usize,
}

impl SessionArchive {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ARCHIVE_CAPACITY)
    }

    /// Keep at most `capacity` sessions, evicting the oldest first
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn record(&self, archived: ArchivedSession) -> Result<SessionId> {
        let session_id = archived.session.session_id;
        let mut records = self.records.write().await;
        records.insert(session_id, archived);

        while records.len() > self.capacity {
            let oldest = records
                .iter()
                .filter(|(id, _)| **id != session_id)
                .min_by_key(|(_, a)| a.archived_at)
                .map(|(id, _)| *id);

            let Some(oldest) = oldest else {
                break;
            };
            records.remove(&oldest);
            debug!(session_id = %oldest, "Archived session evicted");
        }

        Ok(session_id)
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn get(&self, session_id: SessionId) -> Result<Option<ArchivedSession>> {
        let records = self.records.read().await;
        Ok(records.get(&session_id).cloned())
    }

    /// Archived session IDs, oldest first
    pub async fn list(&self) -> Result<Vec<SessionId>> {
        let records = self.records.read().await;

        let mut items: Vec<_> = records
            .iter()
            .map(|(id, archived)| (*id, archived.archived_at))
            .collect();

        items.sort_by_key(|(_, archived_at)| *archived_at);

        Ok(items.into_iter().map(|(id, _)| id).collect())
    }

    /// Recompute the digest and compare with the sealed one
    pub async fn verify_integrity(&self, session_id: SessionId) -> Result<bool> {
        let records = self.records.read().await;

        match records.get(&session_id) {
            Some(archived) => Ok(archived.recompute_digest() == archived.digest),
            None => Ok(false),
        }
    }
}

impl Default for SessionArchive {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 over the JSON encoding, streamed straight into the hasher
pub fn compute_digest<T: Serialize + ?Sized>(value: &T) -> String {
    let mut hasher = Sha256::new();

    if serde_json::to_writer(&mut HashWriter(&mut hasher), value).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventPayload, SpecialistKind};

    fn archived() -> ArchivedSession {
        let session = Session::new("cash deposits".to_string());
        let task = SpecialistTask::pending(session.session_id, SpecialistKind::TransactionPattern);
        let event = Event {
            session_id: session.session_id,
            sequence: 1,
            timestamp: Utc::now(),
            payload: EventPayload::SessionStarted {
                query: "cash deposits".to_string(),
            },
        };
        ArchivedSession::seal(session, vec![task], None, vec![event])
    }

    #[test]
    fn test_digest_is_stable() {
        let a = compute_digest(&serde_json::json!({"k": 1}));
        let b = compute_digest(&serde_json::json!({"k": 1}));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, compute_digest(&serde_json::json!({"k": 2})));
    }

    #[tokio::test]
    async fn test_record_and_verify() {
        let archive = SessionArchive::new();
        let record = archived();
        let id = archive.record(record).await.unwrap();

        assert!(archive.verify_integrity(id).await.unwrap());
        assert_eq!(archive.list().await.unwrap(), vec![id]);
        assert!(archive.get(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_first() {
        let archive = SessionArchive::with_capacity(2);

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(archive.record(archived()).await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(archive.count().await, 2);
        assert!(archive.get(ids[0]).await.unwrap().is_none());
        assert_eq!(archive.list().await.unwrap(), vec![ids[1], ids[2]]);
    }

    #[test]
    fn test_metrics_count_outcomes_and_durations() {
        let session = Session::new("cash deposits".to_string());
        let mut done = SpecialistTask::pending(session.session_id, SpecialistKind::TransactionPattern);
        done.status = TaskStatus::Succeeded;
        done.attempts = 2;
        done.ended_at = Some(done.dispatched_at + chrono::Duration::milliseconds(120));
        let mut slow = SpecialistTask::pending(session.session_id, SpecialistKind::ChainTracing);
        slow.status = TaskStatus::TimedOut;
        slow.ended_at = Some(slow.dispatched_at + chrono::Duration::milliseconds(500));
        let active = SpecialistTask::pending(session.session_id, SpecialistKind::EntityResearch);

        let events = vec![Event {
            session_id: session.session_id,
            sequence: 1,
            timestamp: session.created_at + chrono::Duration::milliseconds(800),
            payload: EventPayload::PatternMatch {
                keys: vec!["pattern:a".into(), "pattern:b".into()],
                kinds: vec![SpecialistKind::ChainTracing],
            },
        }];

        let metrics = InvestigationMetrics::compute(&session, &[done, slow, active], None, &events);
        assert_eq!(metrics.duration_ms, 800);
        assert_eq!(metrics.agents_spawned, 3);
        assert_eq!((metrics.succeeded, metrics.timed_out, metrics.failed), (1, 1, 0));
        assert_eq!(metrics.patterns_matched, 2);
        assert_eq!(metrics.tasks[0].duration_ms, Some(120));
        assert_eq!(metrics.tasks[0].attempts, 2);
        assert_eq!(metrics.tasks[2].duration_ms, None);
        assert!(metrics.risk_level.is_none());
    }

    #[tokio::test]
    async fn test_tampering_detected() {
        let archive = SessionArchive::new();
        let mut record = archived();
        record.tasks[0].risk_score = Some(99.0);
        let id = archive.record(record).await.unwrap();

        assert!(!archive.verify_integrity(id).await.unwrap());
        assert!(!archive.verify_integrity(uuid::Uuid::new_v4()).await.unwrap());
    }
}
