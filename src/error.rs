//! Error types for the investigation orchestrator

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, InvestigationError>;

#[derive(Error, Debug)]
pub enum InvestigationError {

    // =============================
    // Session Lifecycle Errors
    // =============================

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // =============================
    // Collaborator / Task Errors
    // =============================

    #[error("Collaborator error: {0}")]
    CollaboratorError(String),

    #[error("Task timed out: {0}")]
    TaskTimeout(String),

    // =============================
    // Internal Invariants
    // =============================

    #[error("Aggregation error: {0}")]
    AggregationError(String),

    #[error("Stream delivery error: {0}")]
    StreamDeliveryError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl InvestigationError {
    /// Whether this error must move the owning session to `errored`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, InvestigationError::AggregationError(_))
    }

    /// HTTP status used by the API layer
    pub fn status_code(&self) -> StatusCode {
        match self {
            InvestigationError::ValidationError(_) | InvestigationError::UuidError(_) => {
                StatusCode::BAD_REQUEST
            }
            InvestigationError::NotFound(_) => StatusCode::NOT_FOUND,
            InvestigationError::InvalidState(_) => StatusCode::CONFLICT,
            InvestigationError::CollaboratorError(_) | InvestigationError::HttpError(_) => {
                StatusCode::BAD_GATEWAY
            }
            InvestigationError::TaskTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for InvestigationError {
    fn from(e: sqlx::Error) -> Self {
        InvestigationError::DatabaseError(e.to_string())
    }
}
