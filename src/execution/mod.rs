//! Specialist task runner
//!
//! One tokio task per dispatched kind. The runner is the only writer of task
//! records: it drives `pending -> running -> terminal`, emits an event for
//! every transition and reports terminal transitions to the session's
//! coordinator through a completion channel.

use crate::config::RunnerConfig;
use crate::error::InvestigationError;
use crate::events::EventPublisher;
use crate::models::{
    EventPayload, PriorFinding, Session, SessionId, SpecialistContext, SpecialistKind,
    SpecialistReport, SpecialistTask, TaskId, TaskStatus,
};
use crate::specialists::{Specialist, SpecialistRegistry};
use crate::Result;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Sent to the coordinator whenever a task reaches a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub kind: SpecialistKind,
    pub status: TaskStatus,
}

#[derive(Default)]
struct SessionTasks {
    /// Dispatch order
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, SpecialistTask>,
    tokens: HashMap<TaskId, CancellationToken>,
    completions: Option<mpsc::UnboundedSender<TaskCompletion>>,
}

impl SessionTasks {
    fn has_active(&self, kind: SpecialistKind) -> bool {
        self.tasks
            .values()
            .any(|t| t.kind == kind && !t.status.is_terminal())
    }
}

/// How one task ended
enum Outcome {
    Succeeded(SpecialistReport),
    Failed(String),
    TimedOut(String),
    Cancelled,
}

pub struct TaskRunner {
    registry: Arc<SpecialistRegistry>,
    publisher: Arc<EventPublisher>,
    config: RunnerConfig,
    sessions: Mutex<HashMap<SessionId, SessionTasks>>,
}

impl TaskRunner {
    pub fn new(
        registry: Arc<SpecialistRegistry>,
        publisher: Arc<EventPublisher>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionTasks>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session and hand back its completion stream
    pub fn open_session(&self, session_id: SessionId) -> mpsc::UnboundedReceiver<TaskCompletion> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions().entry(session_id).or_default().completions = Some(tx);
        rx
    }

    /// Start one task per kind that is not already active for the session
    pub fn dispatch(
        self: &Arc<Self>,
        session: &Session,
        kinds: &BTreeSet<SpecialistKind>,
        pattern_hints: &[String],
    ) -> Result<Vec<TaskId>> {
        let session_id = session.session_id;
        let session_text = session.session_text();
        let mut started = Vec::new();

        for kind in kinds {
            let specialist = self.registry.get(*kind);
            let cross_task = specialist
                .as_ref()
                .map(|s| s.accepts_cross_task_context())
                .unwrap_or(false);

            let (task, token, prior_findings) = {
                let mut sessions = self.sessions();
                let tasks = sessions.get_mut(&session_id).ok_or_else(|| {
                    InvestigationError::InvalidState(format!(
                        "runner session {} is not open",
                        session_id
                    ))
                })?;

                if tasks.has_active(*kind) {
                    debug!(session_id = %session_id, kind = %kind, "Kind already active, skipping");
                    continue;
                }

                let prior_findings: Vec<PriorFinding> = if cross_task {
                    tasks
                        .order
                        .iter()
                        .filter_map(|id| tasks.tasks.get(id))
                        .filter(|t| t.kind != *kind && t.status == TaskStatus::Succeeded)
                        .map(|t| PriorFinding {
                            kind: t.kind,
                            findings: t.findings.clone(),
                        })
                        .collect()
                } else {
                    Vec::new()
                };

                let task = SpecialistTask::pending(session_id, *kind);
                let token = CancellationToken::new();
                tasks.order.push(task.task_id);
                tasks.tasks.insert(task.task_id, task.clone());
                tasks.tokens.insert(task.task_id, token.clone());
                (task, token, prior_findings)
            };

            self.emit(
                session_id,
                EventPayload::TaskDispatched {
                    task_id: task.task_id,
                    kind: *kind,
                },
            );

            let context = SpecialistContext {
                session_id,
                task_id: task.task_id,
                kind: *kind,
                initial_query: session.initial_query.clone(),
                session_text: session_text.clone(),
                answers: session.answers.clone(),
                prior_findings,
                pattern_hints: pattern_hints.to_vec(),
            };

            let runner = Arc::clone(self);
            tokio::spawn(async move {
                runner.run_task(task.task_id, context, specialist, token).await;
            });

            info!(session_id = %session_id, kind = %kind, task_id = %task.task_id, "Task dispatched");
            started.push(task.task_id);
        }

        Ok(started)
    }

    async fn run_task(
        self: Arc<Self>,
        task_id: TaskId,
        context: SpecialistContext,
        specialist: Option<Arc<dyn Specialist>>,
        token: CancellationToken,
    ) {
        let session_id = context.session_id;
        let kind = context.kind;

        let Some(specialist) = specialist else {
            self.finish(
                session_id,
                task_id,
                Outcome::Failed(format!("no specialist registered for {}", kind)),
            );
            return;
        };

        let timeout = self.config.timeout_for(kind);
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;
        let mut last_error: Option<String> = None;

        let outcome = loop {
            attempt += 1;
            self.mark_running(session_id, task_id, attempt, last_error.take());

            let run = specialist.run(&context, token.clone());
            tokio::pin!(run);

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    // let the specialist wind down, bounded by the grace period
                    let _ = tokio::time::timeout(self.config.cancel_grace, &mut run).await;
                    break Outcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    token.cancel();
                    break timed_out(kind, timeout);
                }
                result = &mut run => result,
            };

            let error = match result {
                Ok(report) if valid_score(report.risk_score) => break Outcome::Succeeded(report),
                Ok(report) => format!("malformed report: risk score {}", report.risk_score),
                Err(e) if is_retryable(&e) => e.to_string(),
                Err(e) => break Outcome::Failed(e.to_string()),
            };

            if attempt > self.config.max_retries {
                break Outcome::Failed(error);
            }

            let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt - 1);
            warn!(
                session_id = %session_id,
                kind = %kind,
                attempt,
                error = %error,
                backoff_ms = backoff.as_millis() as u64,
                "Specialist attempt failed, retrying"
            );
            last_error = Some(error);

            tokio::select! {
                biased;
                _ = token.cancelled() => break Outcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => {
                    token.cancel();
                    break timed_out(kind, timeout);
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        };

        self.finish(session_id, task_id, outcome);
    }

    fn mark_running(&self, session_id: SessionId, task_id: TaskId, attempt: u32, error: Option<String>) {
        let kind = {
            let mut sessions = self.sessions();
            let Some(task) = sessions
                .get_mut(&session_id)
                .and_then(|s| s.tasks.get_mut(&task_id))
            else {
                return;
            };
            task.status = TaskStatus::Running;
            task.attempts = attempt;
            if task.started_at.is_none() {
                task.started_at = Some(Utc::now());
            }
            task.kind
        };

        self.emit(
            session_id,
            EventPayload::TaskUpdated {
                task_id,
                kind,
                status: TaskStatus::Running,
                attempt,
                findings: Vec::new(),
                risk_score: None,
                error,
            },
        );
    }

    /// Record the terminal state, emit it, then notify the coordinator
    fn finish(&self, session_id: SessionId, task_id: TaskId, outcome: Outcome) {
        let (task, completions) = {
            let mut sessions = self.sessions();
            let Some(tasks) = sessions.get_mut(&session_id) else {
                return;
            };
            tasks.tokens.remove(&task_id);
            let completions = tasks.completions.clone();
            let Some(task) = tasks.tasks.get_mut(&task_id) else {
                return;
            };

            match outcome {
                Outcome::Succeeded(report) => {
                    task.status = TaskStatus::Succeeded;
                    task.findings = report.findings;
                    task.risk_score = Some(report.risk_score);
                }
                Outcome::Failed(error) => {
                    task.status = TaskStatus::Failed;
                    task.error = Some(error);
                }
                Outcome::TimedOut(error) => {
                    task.status = TaskStatus::TimedOut;
                    task.error = Some(error);
                }
                Outcome::Cancelled => {
                    task.status = TaskStatus::Cancelled;
                }
            }
            task.ended_at = Some(Utc::now());
            (task.clone(), completions)
        };

        info!(
            session_id = %session_id,
            kind = %task.kind,
            status = ?task.status,
            attempts = task.attempts,
            "Task finished"
        );

        self.emit(
            session_id,
            EventPayload::TaskUpdated {
                task_id,
                kind: task.kind,
                status: task.status,
                attempt: task.attempts,
                findings: task.findings.clone(),
                risk_score: task.risk_score,
                error: task.error.clone(),
            },
        );

        if let Some(tx) = completions {
            let _ = tx.send(TaskCompletion {
                task_id,
                kind: task.kind,
                status: task.status,
            });
        }
    }

    fn emit(&self, session_id: SessionId, payload: EventPayload) {
        if let Err(e) = self.publisher.append(session_id, payload) {
            debug!(session_id = %session_id, error = %e, "Task event not published");
        }
    }

    /// Snapshot of a session's tasks in dispatch order
    pub fn tasks(&self, session_id: SessionId) -> Vec<SpecialistTask> {
        self.sessions()
            .get(&session_id)
            .map(|s| {
                s.order
                    .iter()
                    .filter_map(|id| s.tasks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn task(&self, session_id: SessionId, task_id: TaskId) -> Option<SpecialistTask> {
        self.sessions()
            .get(&session_id)
            .and_then(|s| s.tasks.get(&task_id).cloned())
    }

    pub fn active_count(&self, session_id: SessionId) -> usize {
        self.sessions()
            .get(&session_id)
            .map(|s| s.tasks.values().filter(|t| !t.status.is_terminal()).count())
            .unwrap_or(0)
    }

    pub fn all_terminal(&self, session_id: SessionId) -> bool {
        self.active_count(session_id) == 0
    }

    /// Signal every active task; returns how many were signalled
    pub fn cancel_all(&self, session_id: SessionId) -> usize {
        let sessions = self.sessions();
        let Some(tasks) = sessions.get(&session_id) else {
            return 0;
        };

        for token in tasks.tokens.values() {
            token.cancel();
        }

        if !tasks.tokens.is_empty() {
            info!(session_id = %session_id, count = tasks.tokens.len(), "Cancelling active tasks");
        }
        tasks.tokens.len()
    }

    /// Forget a session, cancelling anything still running
    pub fn close_session(&self, session_id: SessionId) -> Vec<SpecialistTask> {
        let Some(tasks) = self.sessions().remove(&session_id) else {
            return Vec::new();
        };

        for token in tasks.tokens.values() {
            token.cancel();
        }

        tasks
            .order
            .iter()
            .filter_map(|id| tasks.tasks.get(id).cloned())
            .collect()
    }
}

fn timed_out(kind: SpecialistKind, timeout: Duration) -> Outcome {
    let error = InvestigationError::TaskTimeout(format!("{} exceeded {:?}", kind, timeout));
    Outcome::TimedOut(error.to_string())
}

fn valid_score(score: f64) -> bool {
    score.is_finite() && (0.0..=100.0).contains(&score)
}

fn is_retryable(error: &InvestigationError) -> bool {
    matches!(
        error,
        InvestigationError::CollaboratorError(_) | InvestigationError::HttpError(_)
    )
}
