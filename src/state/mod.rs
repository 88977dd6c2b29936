//! Context Store
//!
//! Holds investigation sessions and their question/answer history.
//! Only the orchestrator writes through this interface.

use crate::error::InvestigationError;
use crate::models::{Question, QuestionAnswer, Session, SessionId, SessionStage};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Trait for session persistence
#[async_trait::async_trait]
pub trait ContextStore: Send + Sync {
    async fn create_session(&self, query: &str) -> Result<Session>;
    async fn record_answer(&self, session_id: SessionId, question: &str, answer: &str) -> Result<Session>;
    async fn get_session(&self, session_id: SessionId) -> Result<Session>;
    async fn set_questions(&self, session_id: SessionId, questions: Vec<Question>) -> Result<Session>;
    async fn set_stage(&self, session_id: SessionId, stage: SessionStage) -> Result<Session>;
    async fn remove_session(&self, session_id: SessionId) -> Result<Session>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
}

/// In-memory context store
pub struct InMemoryContextStore {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(session_id: SessionId) -> InvestigationError {
    InvestigationError::NotFound(format!("session {}", session_id))
}

#[async_trait::async_trait]
impl ContextStore for InMemoryContextStore {

    async fn create_session(&self, query: &str) -> Result<Session> {
        let query = query.trim();
        if query.is_empty() {
            return Err(InvestigationError::ValidationError(
                "initial query must not be empty".to_string(),
            ));
        }

        let session = Session::new(query.to_string());

        let mut sessions = self.sessions.write().await;
        sessions.insert(session.session_id, session.clone());

        Ok(session)
    }

    async fn record_answer(&self, session_id: SessionId, question: &str, answer: &str) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| not_found(session_id))?;

        if session.stage != SessionStage::CollectingContext {
            return Err(InvestigationError::InvalidState(format!(
                "session {} is past context collection ({:?})",
                session_id, session.stage
            )));
        }

        let answer = answer.trim();
        if answer.is_empty() {
            return Err(InvestigationError::ValidationError(
                "answer must not be empty".to_string(),
            ));
        }

        session.answers.push(QuestionAnswer {
            question: question.to_string(),
            answer: answer.to_string(),
        });
        session.last_activity_at = Utc::now();

        Ok(session.clone())
    }

    async fn get_session(&self, session_id: SessionId) -> Result<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).cloned().ok_or_else(|| not_found(session_id))
    }

    async fn set_questions(&self, session_id: SessionId, questions: Vec<Question>) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| not_found(session_id))?;

        if session.stage != SessionStage::CollectingContext {
            return Err(InvestigationError::InvalidState(format!(
                "questions can only be set while collecting context (session {})",
                session_id
            )));
        }

        session.questions = questions;
        session.last_activity_at = Utc::now();
        Ok(session.clone())
    }

    async fn set_stage(&self, session_id: SessionId, stage: SessionStage) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(&session_id).ok_or_else(|| not_found(session_id))?;

        if !session.stage.can_transition_to(stage) {
            return Err(InvestigationError::InvalidState(format!(
                "illegal transition {:?} -> {:?} for session {}",
                session.stage, stage, session_id
            )));
        }

        session.stage = stage;
        session.last_activity_at = Utc::now();
        Ok(session.clone())
    }

    async fn remove_session(&self, session_id: SessionId) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(&session_id).ok_or_else(|| not_found(session_id))
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = self.sessions.read().await;
        let mut all: Vec<Session> = sessions.values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        Ok(all)
    }
}
