//! Core data models for the investigation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type TaskId = Uuid;

//
// ================= Enums =================
//

/// Category of delegated analysis
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum SpecialistKind {
    EntityResearch,
    GeographicRouting,
    TransactionPattern,
    ChainTracing,
}

impl SpecialistKind {
    pub const ALL: [SpecialistKind; 4] = [
        SpecialistKind::EntityResearch,
        SpecialistKind::GeographicRouting,
        SpecialistKind::TransactionPattern,
        SpecialistKind::ChainTracing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistKind::EntityResearch => "entity-research",
            SpecialistKind::GeographicRouting => "geographic-routing",
            SpecialistKind::TransactionPattern => "transaction-pattern",
            SpecialistKind::ChainTracing => "chain-tracing",
        }
    }

    /// Static kind → category table
    pub fn category(&self) -> RiskCategory {
        match self {
            SpecialistKind::EntityResearch => RiskCategory::Behavioral,
            SpecialistKind::GeographicRouting => RiskCategory::Geographic,
            SpecialistKind::TransactionPattern => RiskCategory::Transactional,
            SpecialistKind::ChainTracing => RiskCategory::Typology,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

/// Weight bucket a specialist sub-score lands in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskCategory {
    Behavioral,
    Geographic,
    Transactional,
    Typology,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 4] = [
        RiskCategory::Behavioral,
        RiskCategory::Geographic,
        RiskCategory::Transactional,
        RiskCategory::Typology,
    ];

    /// Kind whose sub-score feeds this category
    pub fn specialist(&self) -> SpecialistKind {
        match self {
            RiskCategory::Behavioral => SpecialistKind::EntityResearch,
            RiskCategory::Geographic => SpecialistKind::GeographicRouting,
            RiskCategory::Transactional => SpecialistKind::TransactionPattern,
            RiskCategory::Typology => SpecialistKind::ChainTracing,
        }
    }
}

/// Session lifecycle stage
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStage {
    CollectingContext,
    Dispatching,
    Running,
    Aggregating,
    Complete,
    Errored,
}

impl SessionStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStage::Complete | SessionStage::Errored)
    }

    /// Legal edges of the session state machine
    pub fn can_transition_to(&self, next: SessionStage) -> bool {
        use SessionStage::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Errored) => true,
            // abort from any non-terminal stage closes the session
            (_, Complete) => true,
            (CollectingContext, Dispatching) => true,
            (Dispatching, Running) => true,
            (Running, Aggregating) => true,
            (Aggregating, Running) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Recommendation {
    File,
    Monitor,
    Clear,
}

//
// ================= Session =================
//

/// Follow-up question with multiple-choice options
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionAnswer {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub initial_query: String,
    pub questions: Vec<Question>,
    pub answers: Vec<QuestionAnswer>,
    pub stage: SessionStage,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    pub fn new(initial_query: String) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            initial_query,
            questions: Vec::new(),
            answers: Vec::new(),
            stage: SessionStage::CollectingContext,
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Query plus every answer, case-normalized
    pub fn session_text(&self) -> String {
        let mut text = self.initial_query.to_lowercase();
        for qa in &self.answers {
            text.push('\n');
            text.push_str(&qa.answer.to_lowercase());
        }
        text
    }

    /// First generated question that has no recorded answer yet
    pub fn next_unanswered(&self) -> Option<&Question> {
        self.questions
            .iter()
            .find(|q| !self.answers.iter().any(|a| a.question == q.question))
    }
}

//
// ================= Tasks =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistTask {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub kind: SpecialistKind,
    pub status: TaskStatus,
    pub findings: Vec<String>,
    pub risk_score: Option<f64>,
    pub attempts: u32,
    pub dispatched_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SpecialistTask {
    pub fn pending(session_id: SessionId, kind: SpecialistKind) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            session_id,
            kind,
            status: TaskStatus::Pending,
            findings: Vec::new(),
            risk_score: None,
            attempts: 0,
            dispatched_at: Utc::now(),
            started_at: None,
            ended_at: None,
            error: None,
        }
    }
}

/// Payload handed to a specialist
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialistContext {
    pub session_id: SessionId,
    pub task_id: TaskId,
    pub kind: SpecialistKind,
    pub initial_query: String,
    pub session_text: String,
    pub answers: Vec<QuestionAnswer>,
    /// Findings of already-succeeded tasks of other kinds
    pub prior_findings: Vec<PriorFinding>,
    /// Keys of previously confirmed patterns that matched this session
    pub pattern_hints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorFinding {
    pub kind: SpecialistKind,
    pub findings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpecialistReport {
    pub findings: Vec<String>,
    pub risk_score: f64,
}

//
// ================= Risk =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryScore {
    pub category: RiskCategory,
    pub weight: f64,
    pub score: f64,
    pub kind: SpecialistKind,
    pub task_status: Option<TaskStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateRisk {
    pub overall_score: f64,
    pub categories: Vec<CategoryScore>,
    pub confidence: f64,
    pub confidence_level: ConfidenceLevel,
    pub recommendation: Recommendation,
    pub provisional: bool,
    pub succeeded: usize,
    pub dispatched: usize,
}

//
// ================= Events =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub session_id: SessionId,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted {
        query: String,
    },
    StageChanged {
        stage: SessionStage,
    },
    AnswerRecorded {
        question: String,
        answer: String,
    },
    PatternMatch {
        keys: Vec<String>,
        kinds: Vec<SpecialistKind>,
    },
    DispatchDecided {
        kinds: Vec<SpecialistKind>,
    },
    TaskDispatched {
        task_id: TaskId,
        kind: SpecialistKind,
    },
    TaskUpdated {
        task_id: TaskId,
        kind: SpecialistKind,
        status: TaskStatus,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        findings: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        risk_score: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    RiskRecomputed {
        risk: AggregateRisk,
    },
    SessionComplete {
        summary: String,
        risk: AggregateRisk,
    },
    SessionError {
        summary: String,
    },
}

impl EventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::SessionComplete { .. } | EventPayload::SessionError { .. }
        )
    }

    /// Wire name, also used as the SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::SessionStarted { .. } => "session_started",
            EventPayload::StageChanged { .. } => "stage_changed",
            EventPayload::AnswerRecorded { .. } => "answer_recorded",
            EventPayload::PatternMatch { .. } => "pattern_match",
            EventPayload::DispatchDecided { .. } => "dispatch_decided",
            EventPayload::TaskDispatched { .. } => "task_dispatched",
            EventPayload::TaskUpdated { .. } => "task_updated",
            EventPayload::RiskRecomputed { .. } => "risk_recomputed",
            EventPayload::SessionComplete { .. } => "session_complete",
            EventPayload::SessionError { .. } => "session_error",
        }
    }
}

impl fmt::Display for SpecialistKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Recommendation::File => "FILE",
            Recommendation::Monitor => "MONITOR",
            Recommendation::Clear => "CLEAR",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfidenceLevel::Low => "Low",
            ConfidenceLevel::Medium => "Medium",
            ConfidenceLevel::High => "High",
        };
        write!(f, "{}", s)
    }
}
