//! Session orchestrator
//!
//! collecting-context → dispatching → running ⇄ aggregating → complete
//!
//! `errored` is reachable from every non-terminal stage. The orchestrator is
//! the only writer of session records; each dispatched session is driven by a
//! single coordinator task consuming task completions, abort commands and the
//! session deadline.

use crate::audit::{ArchivedSession, InvestigationMetrics, SessionArchive};
use crate::config::{Config, OrchestratorConfig, RunnerConfig};
use crate::dispatch::DispatchPolicy;
use crate::error::InvestigationError;
use crate::events::{EventPublisher, EventSubscription};
use crate::execution::{TaskCompletion, TaskRunner};
use crate::memory::{
    signature_key, signature_terms, EntityReputation, InMemoryPatternMemory, PatternMemory,
    PatternMetadata, PatternRecord, PostgresPatternMemory,
};
use crate::models::{
    AggregateRisk, EventPayload, Question, Session, SessionId, SessionStage, SpecialistKind,
    SpecialistTask, TaskStatus,
};
use crate::questions::{GeminiQuestionGenerator, QuestionGenerator, TemplateQuestionGenerator};
use crate::risk::{RiskAggregator, RiskModel, FILE_THRESHOLD};
use crate::specialists::{create_default_registry, create_http_registry, SpecialistRegistry};
use crate::state::{ContextStore, InMemoryContextStore};
use crate::Result;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Recalled signatures consulted per session
const MAX_PATTERN_HINTS: usize = 10;

/// Slack on top of the runner's cancel grace when waiting for tasks to settle
const SETTLE_MARGIN: Duration = Duration::from_millis(250);

enum Command {
    Abort(oneshot::Sender<Result<AggregateRisk>>),
}

/// Main orchestrator that drives every investigation session
pub struct Orchestrator {
    store: Box<dyn ContextStore>,
    questions: Box<dyn QuestionGenerator>,
    policy: DispatchPolicy,
    runner: Arc<TaskRunner>,
    publisher: Arc<EventPublisher>,
    aggregator: RiskAggregator,
    memory: Option<Arc<dyn PatternMemory>>,
    archive: SessionArchive,
    config: OrchestratorConfig,
    coordinators: Mutex<HashMap<SessionId, mpsc::Sender<Command>>>,
    risks: Mutex<HashMap<SessionId, AggregateRisk>>,
}

impl Orchestrator {
    pub fn new(
        store: Box<dyn ContextStore>,
        questions: Box<dyn QuestionGenerator>,
        registry: SpecialistRegistry,
        memory: Option<Arc<dyn PatternMemory>>,
        risk_model: RiskModel,
        runner_config: RunnerConfig,
        config: OrchestratorConfig,
    ) -> Self {
        let publisher = Arc::new(EventPublisher::new(config.event_buffer));
        let runner = Arc::new(TaskRunner::new(
            Arc::new(registry),
            publisher.clone(),
            runner_config,
        ));

        Self {
            store,
            questions,
            policy: DispatchPolicy::default(),
            runner,
            publisher,
            aggregator: RiskAggregator::new(risk_model),
            memory,
            archive: SessionArchive::with_capacity(config.archive_capacity),
            config,
            coordinators: Mutex::new(HashMap::new()),
            risks: Mutex::new(HashMap::new()),
        }
    }

    /// Wire collaborators from configuration.
    ///
    /// Gemini questions when a key is set, HTTP specialists when a base URL
    /// is set, Postgres pattern memory when a database URL is set; in-process
    /// implementations otherwise.
    pub fn from_config(config: &Config) -> Result<Self> {
        let questions: Box<dyn QuestionGenerator> = match &config.gemini_api_key {
            Some(key) => {
                info!("Question generator: gemini");
                Box::new(GeminiQuestionGenerator::new(key.clone())?)
            }
            None => {
                info!("Question generator: templates");
                Box::new(TemplateQuestionGenerator)
            }
        };

        let registry = match &config.specialist_api_base_url {
            Some(url) => {
                info!(base_url = %url, "Specialists: http");
                create_http_registry(url)?
            }
            None => {
                info!("Specialists: rule-based");
                create_default_registry()
            }
        };

        let memory: Arc<dyn PatternMemory> = match &config.database_url {
            Some(url) => Arc::new(PostgresPatternMemory::connect_lazy(url)?),
            None => {
                info!("Pattern memory backend: in-memory");
                Arc::new(InMemoryPatternMemory::new())
            }
        };

        let risk_model = RiskModel::new(config.risk_weights.clone())?;

        Ok(Self::new(
            Box::new(InMemoryContextStore::new()),
            questions,
            registry,
            Some(memory),
            risk_model,
            config.runner.clone(),
            config.orchestrator.clone(),
        ))
    }

    fn coordinators(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<Command>>> {
        self.coordinators.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn risks(&self) -> MutexGuard<'_, HashMap<SessionId, AggregateRisk>> {
        self.risks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, session_id: SessionId, payload: EventPayload) {
        if let Err(e) = self.publisher.append(session_id, payload) {
            warn!(session_id = %session_id, error = %e, "Event dropped");
        }
    }

    async fn transition(&self, session_id: SessionId, stage: SessionStage) -> Result<Session> {
        let session = self.store.set_stage(session_id, stage).await?;
        self.emit(session_id, EventPayload::StageChanged { stage });
        Ok(session)
    }

    // =============================
    // Context collection
    // =============================

    /// Open a session and generate its follow-up questions.
    ///
    /// A session without questions is dispatched immediately.
    pub async fn create_session(self: &Arc<Self>, query: &str) -> Result<Session> {
        let session = self.store.create_session(query).await?;
        let session_id = session.session_id;

        info!(session_id = %session_id, query = %session.initial_query, "Session created");
        self.emit(
            session_id,
            EventPayload::SessionStarted {
                query: session.initial_query.clone(),
            },
        );

        let questions = self.generate_questions(&session.initial_query).await;
        let session = self.store.set_questions(session_id, questions).await?;

        if session.questions.is_empty() {
            self.finish_context(session_id).await?;
            return self.store.get_session(session_id).await;
        }

        Ok(session)
    }

    async fn generate_questions(&self, query: &str) -> Vec<Question> {
        match tokio::time::timeout(
            self.config.question_timeout,
            self.questions.generate_questions(query),
        )
        .await
        {
            Ok(Ok(questions)) => questions,
            Ok(Err(e)) => {
                warn!(error = %e, "Question generator failed - using templates");
                TemplateQuestionGenerator::questions_for(query)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.question_timeout.as_millis() as u64,
                    "Question generator timed out - using templates"
                );
                TemplateQuestionGenerator::questions_for(query)
            }
        }
    }

    /// Record an answer to an explicit question
    pub async fn record_answer(
        &self,
        session_id: SessionId,
        question: &str,
        answer: &str,
    ) -> Result<Session> {
        let session = self.store.record_answer(session_id, question, answer).await?;

        if let Some(qa) = session.answers.last() {
            self.emit(
                session_id,
                EventPayload::AnswerRecorded {
                    question: qa.question.clone(),
                    answer: qa.answer.clone(),
                },
            );
        }

        Ok(session)
    }

    /// Answer the next unanswered question; the last answer triggers dispatch
    pub async fn submit_answer(self: &Arc<Self>, session_id: SessionId, answer: &str) -> Result<Session> {
        let session = self.store.get_session(session_id).await?;

        if session.stage != SessionStage::CollectingContext {
            return Err(InvestigationError::InvalidState(format!(
                "session {} is no longer collecting context ({:?})",
                session_id, session.stage
            )));
        }

        let question = session
            .next_unanswered()
            .map(|q| q.question.clone())
            .ok_or_else(|| {
                InvestigationError::InvalidState(format!(
                    "session {} has no question awaiting an answer",
                    session_id
                ))
            })?;

        let session = self.record_answer(session_id, &question, answer).await?;

        if session.next_unanswered().is_none() {
            self.finish_context(session_id).await?;
            return self.store.get_session(session_id).await;
        }

        Ok(session)
    }

    // =============================
    // Dispatch
    // =============================

    /// End context collection and dispatch specialists
    pub async fn finish_context(self: &Arc<Self>, session_id: SessionId) -> Result<Vec<SpecialistKind>> {
        let session = self.transition(session_id, SessionStage::Dispatching).await?;
        let text = session.session_text();

        let (hints, pattern_kinds) = self.recall_patterns(&text).await;
        if !hints.is_empty() {
            self.emit(
                session_id,
                EventPayload::PatternMatch {
                    keys: hints.clone(),
                    kinds: pattern_kinds.iter().copied().collect(),
                },
            );
        }

        let mut kinds = self.policy.decide(&text);
        kinds.extend(pattern_kinds);

        debug!(
            session_id = %session_id,
            fired = ?self.policy.explain(&text),
            "Dispatch signals"
        );
        info!(session_id = %session_id, kinds = ?kinds, "Dispatch decided");
        self.emit(
            session_id,
            EventPayload::DispatchDecided {
                kinds: kinds.iter().copied().collect(),
            },
        );

        let completions = self.runner.open_session(session_id);
        let task_ids = match self.runner.dispatch(&session, &kinds, &hints) {
            Ok(ids) => ids,
            Err(e) => {
                self.fail(session_id, &e).await;
                return Err(e);
            }
        };

        if let Err(e) = self.transition(session_id, SessionStage::Running).await {
            // closed while dispatching
            self.runner.cancel_all(session_id);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(4);
        self.coordinators().insert(session_id, tx);

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator
                .coordinate(session_id, task_ids.len(), completions, rx, hints)
                .await;
        });

        Ok(kinds.into_iter().collect())
    }

    /// Keys and kinds of confident stored signatures matching the text.
    /// Memory failures only cost the bias, never the session.
    async fn recall_patterns(&self, text: &str) -> (Vec<String>, BTreeSet<SpecialistKind>) {
        let Some(memory) = &self.memory else {
            return (Vec::new(), BTreeSet::new());
        };
        let threshold = self.config.pattern_confidence_threshold;

        let lookup = async {
            let keys = memory.search(text).await?;
            let mut records = Vec::new();
            for key in keys.iter().take(MAX_PATTERN_HINTS) {
                if let Some(record) = memory.get(key).await? {
                    records.push(record);
                }
            }
            Ok::<Vec<PatternRecord>, InvestigationError>(records)
        };

        match tokio::time::timeout(self.config.memory_timeout, lookup).await {
            Ok(Ok(records)) => {
                let strong: Vec<PatternRecord> = records
                    .into_iter()
                    .filter(|r| r.metadata.confidence >= threshold)
                    .collect();
                let kinds = DispatchPolicy::kinds_for_patterns(&strong, threshold);
                (strong.into_iter().map(|r| r.key).collect(), kinds)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Pattern memory lookup failed - rule-based dispatch only");
                (Vec::new(), BTreeSet::new())
            }
            Err(_) => {
                warn!("Pattern memory lookup timed out - rule-based dispatch only");
                (Vec::new(), BTreeSet::new())
            }
        }
    }

    // =============================
    // Coordination
    // =============================

    async fn coordinate(
        self: Arc<Self>,
        session_id: SessionId,
        mut outstanding: usize,
        mut completions: mpsc::UnboundedReceiver<TaskCompletion>,
        mut commands: mpsc::Receiver<Command>,
        hints: Vec<String>,
    ) {
        let deadline = Instant::now() + self.config.session_timeout;

        let result: Result<()> = loop {
            tokio::select! {
                done = completions.recv() => match done {
                    Some(done) => {
                        outstanding = outstanding.saturating_sub(1);
                        match self.on_task_finished(session_id, &done, outstanding == 0).await {
                            Ok(true) => break self.complete(session_id, &hints).await.map(|_| ()),
                            Ok(false) => continue,
                            Err(e) => break Err(e),
                        }
                    }
                    None => break self.complete(session_id, &hints).await.map(|_| ()),
                },
                Some(command) = commands.recv() => match command {
                    Command::Abort(reply) => {
                        info!(session_id = %session_id, "Abort requested");
                        match self.settle(session_id, &mut completions, "Investigation aborted").await {
                            Ok(risk) => {
                                let _ = reply.send(Ok(risk));
                                break Ok(());
                            }
                            Err(e) => {
                                if e.is_fatal() {
                                    self.fail(session_id, &e).await;
                                }
                                let _ = reply.send(Err(e));
                                self.coordinators().remove(&session_id);
                                return;
                            }
                        }
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(session_id = %session_id, "Session deadline reached - cancelling active tasks");
                    break self
                        .settle(session_id, &mut completions, "Session deadline reached")
                        .await
                        .map(|_| ());
                }
            }
        };

        self.coordinators().remove(&session_id);

        match result {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.fail(session_id, &e).await,
            Err(e) => {
                // the session was closed or removed underneath the coordinator
                warn!(session_id = %session_id, error = %e, "Coordinator stopped");
                self.runner.cancel_all(session_id);
            }
        }
    }

    /// Recompute after a terminal task; true once the last one is in
    async fn on_task_finished(
        &self,
        session_id: SessionId,
        done: &TaskCompletion,
        last: bool,
    ) -> Result<bool> {
        debug!(
            session_id = %session_id,
            kind = %done.kind,
            status = ?done.status,
            "Task completion received"
        );

        self.transition(session_id, SessionStage::Aggregating).await?;

        let tasks = self.runner.tasks(session_id);
        let risk = self.aggregator.recompute(&tasks)?;
        self.risks().insert(session_id, risk.clone());
        self.emit(session_id, EventPayload::RiskRecomputed { risk });

        if last {
            return Ok(true);
        }

        self.transition(session_id, SessionStage::Running).await?;
        Ok(false)
    }

    async fn complete(&self, session_id: SessionId, hints: &[String]) -> Result<AggregateRisk> {
        let session = self.store.get_session(session_id).await?;
        let tasks = self.runner.tasks(session_id);
        let risk = self.aggregator.recompute(&tasks)?;

        self.learn_patterns(&session, &tasks, hints).await;

        self.risks().insert(session_id, risk.clone());
        self.transition(session_id, SessionStage::Complete).await?;

        info!(
            session_id = %session_id,
            overall = risk.overall_score,
            recommendation = %risk.recommendation,
            confidence = %risk.confidence_level,
            provisional = risk.provisional,
            "Session complete"
        );

        self.emit(
            session_id,
            EventPayload::SessionComplete {
                summary: summarize(&risk, &tasks, None),
                risk: risk.clone(),
            },
        );

        Ok(risk)
    }

    /// Cancel everything, wait for tasks to settle, close provisionally
    async fn settle(
        &self,
        session_id: SessionId,
        completions: &mut mpsc::UnboundedReceiver<TaskCompletion>,
        reason: &str,
    ) -> Result<AggregateRisk> {
        self.runner.cancel_all(session_id);

        let until = Instant::now() + self.runner.config().cancel_grace + SETTLE_MARGIN;
        while !self.runner.all_terminal(session_id) {
            match tokio::time::timeout_at(until, completions.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    warn!(
                        session_id = %session_id,
                        active = self.runner.active_count(session_id),
                        "Tasks did not settle in time"
                    );
                    break;
                }
            }
        }

        self.close_provisional(session_id, reason).await
    }

    async fn close_provisional(&self, session_id: SessionId, reason: &str) -> Result<AggregateRisk> {
        let tasks = self.runner.tasks(session_id);
        let risk = self.aggregator.recompute_aborted(&tasks)?;

        self.risks().insert(session_id, risk.clone());
        self.transition(session_id, SessionStage::Complete).await?;

        info!(
            session_id = %session_id,
            overall = risk.overall_score,
            confidence = %risk.confidence_level,
            reason,
            "Session closed early"
        );

        self.emit(
            session_id,
            EventPayload::SessionComplete {
                summary: summarize(&risk, &tasks, Some(reason)),
                risk: risk.clone(),
            },
        );

        Ok(risk)
    }

    async fn fail(&self, session_id: SessionId, cause: &InvestigationError) {
        error!(session_id = %session_id, error = %cause, "Session failed");

        self.runner.cancel_all(session_id);
        if let Err(e) = self.transition(session_id, SessionStage::Errored).await {
            warn!(session_id = %session_id, error = %e, "Could not mark session errored");
        }

        self.emit(
            session_id,
            EventPayload::SessionError {
                summary: format!("Investigation failed: {}", cause),
            },
        );
    }

    /// Fold the outcome into pattern memory: recalled signatures are scored
    /// against this session, new high-risk findings become signatures.
    async fn learn_patterns(&self, session: &Session, tasks: &[SpecialistTask], hints: &[String]) {
        let Some(memory) = &self.memory else {
            return;
        };
        let text = session.session_text();

        let work = async {
            let mut touched: HashSet<String> = HashSet::new();

            for key in hints {
                let Some(mut record) = memory.get(key).await? else {
                    continue;
                };
                let Some(kind) = record.metadata.kind else {
                    continue;
                };
                let Some(task) = latest_task(tasks, kind) else {
                    continue;
                };

                record.metadata.observe(is_confirmed(task));
                memory.set(key, record.value, record.metadata).await?;
                touched.insert(key.clone());
            }

            for task in tasks.iter().filter(|t| is_confirmed(t)) {
                let terms = self.policy.matched_terms(task.kind, &text);
                let key = signature_key(task.kind, &terms, &task.findings);
                if touched.contains(&key) {
                    continue;
                }

                let metadata = match memory.get(&key).await? {
                    Some(mut existing) => {
                        existing.metadata.observe(true);
                        existing.metadata
                    }
                    None => PatternMetadata::confirmed(Some(task.kind)),
                };

                let value = serde_json::json!({
                    "query": session.initial_query,
                    "findings": task.findings,
                    "risk_score": task.risk_score,
                    "session_id": session.session_id,
                });
                memory.set(&key, value, metadata).await?;
                touched.insert(key);
            }

            Ok::<usize, InvestigationError>(touched.len())
        };

        match tokio::time::timeout(self.config.memory_timeout, work).await {
            Ok(Ok(count)) => {
                debug!(session_id = %session.session_id, count, "Pattern memory updated");
            }
            Ok(Err(e)) => {
                warn!(session_id = %session.session_id, error = %e, "Pattern learning failed");
            }
            Err(_) => {
                warn!(session_id = %session.session_id, "Pattern learning timed out");
            }
        }
    }

    // =============================
    // Lifecycle
    // =============================

    /// Close a session early with a provisional snapshot
    pub async fn abort(&self, session_id: SessionId) -> Result<AggregateRisk> {
        let session = self.store.get_session(session_id).await?;
        if session.stage.is_terminal() {
            return Err(InvestigationError::InvalidState(format!(
                "session {} is already {:?}",
                session_id, session.stage
            )));
        }

        let coordinator = self.coordinators().get(&session_id).cloned();

        match coordinator {
            Some(commands) => {
                let finished = || {
                    InvestigationError::InvalidState(format!(
                        "session {} finished before the abort was handled",
                        session_id
                    ))
                };
                let (reply_tx, reply_rx) = oneshot::channel();
                commands
                    .send(Command::Abort(reply_tx))
                    .await
                    .map_err(|_| finished())?;
                reply_rx.await.map_err(|_| finished())?
            }
            None => {
                info!(session_id = %session_id, stage = ?session.stage, "Aborting before dispatch");
                self.runner.cancel_all(session_id);
                self.close_provisional(session_id, "Investigation aborted").await
            }
        }
    }

    /// Archive and forget a session, aborting it first if still live
    pub async fn close_session(&self, session_id: SessionId) -> Result<ArchivedSession> {
        let session = self.store.get_session(session_id).await?;

        if !session.stage.is_terminal() {
            if let Err(e) = self.abort(session_id).await {
                warn!(session_id = %session_id, error = %e, "Abort before close failed");
            }
        }

        let session = self.store.remove_session(session_id).await?;
        let tasks = self.runner.close_session(session_id);
        let events = self.publisher.remove(session_id);
        let final_risk = self.risks().remove(&session_id);

        let archived = ArchivedSession::seal(session, tasks, final_risk, events);
        self.archive.record(archived.clone()).await?;

        info!(
            session_id = %session_id,
            digest = %archived.digest,
            events = archived.events.len(),
            "Session archived"
        );

        Ok(archived)
    }

    /// Close every session idle for longer than the idle timeout
    pub async fn reap_idle(&self) -> Result<Vec<SessionId>> {
        let idle = chrono::Duration::from_std(self.config.idle_timeout).map_err(|_| {
            InvestigationError::ConfigError("idle timeout out of range".to_string())
        })?;
        let now = Utc::now();

        let mut reaped = Vec::new();
        for session in self.store.list_sessions().await? {
            if now - session.last_activity_at < idle {
                continue;
            }

            match self.close_session(session.session_id).await {
                Ok(_) => reaped.push(session.session_id),
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Could not reap session");
                }
            }
        }

        if !reaped.is_empty() {
            info!(count = reaped.len(), "Reaped idle sessions");
        }

        Ok(reaped)
    }

    pub fn spawn_idle_reaper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.reap_idle().await {
                    warn!(error = %e, "Idle sweep failed");
                }
            }
        })
    }

    // =============================
    // Queries
    // =============================

    pub async fn get_session(&self, session_id: SessionId) -> Result<Session> {
        self.store.get_session(session_id).await
    }

    pub async fn tasks(&self, session_id: SessionId) -> Result<Vec<SpecialistTask>> {
        self.store.get_session(session_id).await?;
        Ok(self.runner.tasks(session_id))
    }

    /// Latest snapshot, or a fresh one if nothing finished yet
    pub async fn current_risk(&self, session_id: SessionId) -> Result<AggregateRisk> {
        self.store.get_session(session_id).await?;

        if let Some(risk) = self.risks().get(&session_id).cloned() {
            return Ok(risk);
        }
        self.aggregator.recompute(&self.runner.tasks(session_id))
    }

    pub async fn subscribe(&self, session_id: SessionId) -> Result<EventSubscription> {
        self.store.get_session(session_id).await?;
        Ok(self.publisher.subscribe(session_id))
    }

    /// One-shot investigation: open, answer in order, dispatch, stream
    pub async fn investigate(
        self: &Arc<Self>,
        query: &str,
        answers: &[String],
    ) -> Result<EventSubscription> {
        let session = self.create_session(query).await?;
        let session_id = session.session_id;
        let subscription = self.publisher.subscribe(session_id);

        let mut stage = session.stage;
        for answer in answers {
            if stage != SessionStage::CollectingContext {
                break;
            }
            stage = self.submit_answer(session_id, answer).await?.stage;
        }

        if stage == SessionStage::CollectingContext {
            self.finish_context(session_id).await?;
        }

        Ok(subscription)
    }

    pub async fn archived_session(&self, session_id: SessionId) -> Result<ArchivedSession> {
        self.archive
            .get(session_id)
            .await?
            .ok_or_else(|| InvestigationError::NotFound(format!("archived session {}", session_id)))
    }

    pub async fn verify_archive(&self, session_id: SessionId) -> Result<bool> {
        self.archive.verify_integrity(session_id).await
    }

    /// Metrics of a live or archived session
    pub async fn metrics(&self, session_id: SessionId) -> Result<InvestigationMetrics> {
        match self.store.get_session(session_id).await {
            Ok(session) => {
                let tasks = self.runner.tasks(session_id);
                let risk = self.risks().get(&session_id).cloned();
                let events = self.publisher.history(session_id);
                Ok(InvestigationMetrics::compute(&session, &tasks, risk.as_ref(), &events))
            }
            Err(InvestigationError::NotFound(_)) => {
                Ok(self.archived_session(session_id).await?.metrics)
            }
            Err(e) => Err(e),
        }
    }

    // =============================
    // Pattern memory
    // =============================

    fn memory(&self) -> Result<&Arc<dyn PatternMemory>> {
        self.memory.as_ref().ok_or_else(|| {
            InvestigationError::InvalidState("pattern memory is not configured".to_string())
        })
    }

    async fn bounded<T>(&self, work: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.memory_timeout, work)
            .await
            .map_err(|_| InvestigationError::CollaboratorError("pattern memory timed out".to_string()))?
    }

    /// Store a signature by hand, as if a session had confirmed it.
    ///
    /// The key is derived from the kind, the terms and the value, so the
    /// same submission reinforces the existing record.
    pub async fn learn_pattern(
        &self,
        kind: SpecialistKind,
        terms: &[String],
        value: serde_json::Value,
        confidence: Option<f64>,
    ) -> Result<PatternRecord> {
        let memory = self.memory()?;

        let terms: Vec<&str> = terms.iter().map(|t| t.as_str()).collect();
        if signature_terms(&terms).is_empty() {
            return Err(InvestigationError::ValidationError(
                "at least one searchable term is required".to_string(),
            ));
        }
        if let Some(c) = confidence {
            if !(0.0..=1.0).contains(&c) {
                return Err(InvestigationError::ValidationError(format!(
                    "confidence must be within 0..=1, got {}",
                    c
                )));
            }
        }

        let key = signature_key(kind, &terms, &[value.to_string()]);

        let record = self
            .bounded(async {
                let mut metadata = match memory.get(&key).await? {
                    Some(mut existing) => {
                        existing.metadata.observe(true);
                        existing.metadata
                    }
                    None => PatternMetadata::confirmed(Some(kind)),
                };
                if let Some(c) = confidence {
                    metadata.confidence = c;
                }

                memory.set(&key, value.clone(), metadata.clone()).await?;
                Ok::<PatternRecord, InvestigationError>(PatternRecord {
                    key: key.clone(),
                    value,
                    metadata,
                })
            })
            .await?;

        info!(key = %record.key, kind = %kind, "Pattern learned");
        Ok(record)
    }

    pub async fn entity_reputation(&self, entity_name: &str) -> Result<EntityReputation> {
        if entity_name.trim().is_empty() {
            return Err(InvestigationError::ValidationError("entity name is empty".to_string()));
        }
        let memory = self.memory()?;

        self.bounded(memory.entity(entity_name))
            .await?
            .ok_or_else(|| InvestigationError::NotFound(format!("entity {}", entity_name.trim())))
    }

    /// Fold one investigation's view of an entity into its reputation
    pub async fn record_entity(
        &self,
        entity_name: &str,
        risk_score: f64,
        sanctions_status: Option<String>,
        adverse_media: Option<String>,
    ) -> Result<EntityReputation> {
        if entity_name.trim().is_empty() {
            return Err(InvestigationError::ValidationError("entity name is empty".to_string()));
        }
        if !risk_score.is_finite() || !(0.0..=100.0).contains(&risk_score) {
            return Err(InvestigationError::ValidationError(format!(
                "risk score must be within 0..=100, got {}",
                risk_score
            )));
        }
        let memory = self.memory()?;

        let reputation = self
            .bounded(async {
                let mut reputation = match memory.entity(entity_name).await? {
                    Some(mut existing) => {
                        existing.observe(risk_score);
                        existing
                    }
                    None => EntityReputation::new(entity_name, risk_score),
                };
                if let Some(status) = sanctions_status {
                    reputation.sanctions_status = status;
                }
                if let Some(media) = adverse_media {
                    reputation.adverse_media = media;
                }

                memory.set_entity(reputation.clone()).await?;
                Ok::<EntityReputation, InvestigationError>(reputation)
            })
            .await?;

        info!(
            entity = %reputation.entity_name,
            risk_score,
            investigations = reputation.investigation_count,
            "Entity reputation recorded"
        );
        Ok(reputation)
    }

    /// Stored signatures matching a query, strongest first
    pub async fn patterns(&self, query: &str) -> Result<Vec<PatternRecord>> {
        let Some(memory) = &self.memory else {
            return Ok(Vec::new());
        };

        let mut records = Vec::new();
        for key in memory.search(query).await? {
            if let Some(record) = memory.get(&key).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

fn latest_task(tasks: &[SpecialistTask], kind: SpecialistKind) -> Option<&SpecialistTask> {
    tasks
        .iter()
        .filter(|t| t.kind == kind)
        .max_by_key(|t| t.dispatched_at)
}

fn is_confirmed(task: &SpecialistTask) -> bool {
    task.status == TaskStatus::Succeeded && task.risk_score.unwrap_or(0.0) >= FILE_THRESHOLD
}

/// Human-readable closing summary
fn summarize(risk: &AggregateRisk, tasks: &[SpecialistTask], reason: Option<&str>) -> String {
    let mut out = format!(
        "Recommendation: {} (overall {:.2}/100, confidence {}, {}/{} specialists succeeded)",
        risk.recommendation, risk.overall_score, risk.confidence_level, risk.succeeded, risk.dispatched
    );
    if risk.provisional {
        out.push_str(" [provisional]");
    }
    if let Some(reason) = reason {
        out.push('\n');
        out.push_str(reason);
    }

    for task in tasks {
        match task.status {
            TaskStatus::Succeeded => {
                for finding in &task.findings {
                    out.push_str(&format!("\n- [{}] {}", task.kind, finding));
                }
            }
            status => {
                out.push_str(&format!("\n- [{}] {:?}", task.kind, status));
                if let Some(error) = &task.error {
                    out.push_str(&format!(": {}", error));
                }
            }
        }
    }

    out
}
