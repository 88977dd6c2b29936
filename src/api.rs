//! REST API Server for the investigation orchestrator
//!
//! Session lifecycle endpoints plus Server-Sent Event streams of the
//! per-session event log.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::Orchestrator;
use crate::error::InvestigationError;
use crate::events::{EventSubscription, StreamItem};
use crate::models::SpecialistKind;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CreateSessionRequest {
    pub query: String,
}

/// Either answers the next pending question, or an explicit one when
/// `question` is given
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnswerRequest {
    pub answer: String,
    #[serde(default)]
    pub question: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct InvestigateRequest {
    pub query: String,
    #[serde(default)]
    pub answers: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatternQuery {
    #[serde(default)]
    pub query: String,
}

/// Manually taught signature
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LearnRequest {
    pub kind: SpecialistKind,
    pub terms: Vec<String>,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EntityRequest {
    pub risk_score: f64,
    #[serde(default)]
    pub sanctions_status: Option<String>,
    #[serde(default)]
    pub adverse_media: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiResult = (StatusCode, Json<ApiResponse>);

fn ok<T: Serialize>(data: T) -> ApiResult {
    (StatusCode::OK, Json(ApiResponse::success(data)))
}

fn failure(e: InvestigationError) -> ApiResult {
    let status = e.status_code();
    if status.is_server_error() {
        warn!(error = %e, status = status.as_u16(), "Request failed");
    }
    (status, Json(ApiResponse::error(e.to_string())))
}

fn parse_session_id(raw: &str) -> Result<Uuid, InvestigationError> {
    Ok(Uuid::parse_str(raw.trim())?)
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Session Endpoints
/// =============================

async fn create_session(
    State(state): State<ApiState>,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult {
    info!(query = %req.query, "Create session request");

    match state.orchestrator.create_session(&req.query).await {
        Ok(session) => (StatusCode::CREATED, Json(ApiResponse::success(session))),
        Err(e) => failure(e),
    }
}

async fn submit_answer(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AnswerRequest>,
) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    let result = match &req.question {
        Some(question) => {
            state
                .orchestrator
                .record_answer(session_id, question, &req.answer)
                .await
        }
        None => state.orchestrator.submit_answer(session_id, &req.answer).await,
    };

    match result {
        Ok(session) => ok(session),
        Err(e) => failure(e),
    }
}

async fn dispatch_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    match state.orchestrator.finish_context(session_id).await {
        Ok(kinds) => ok(serde_json::json!({
            "session_id": session_id,
            "dispatched": kinds,
        })),
        Err(e) => failure(e),
    }
}

async fn abort_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    match state.orchestrator.abort(session_id).await {
        Ok(risk) => ok(risk),
        Err(e) => failure(e),
    }
}

async fn get_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    let snapshot = async {
        let session = state.orchestrator.get_session(session_id).await?;
        let tasks = state.orchestrator.tasks(session_id).await?;
        let risk = state.orchestrator.current_risk(session_id).await?;
        Ok::<_, InvestigationError>(serde_json::json!({
            "session": session,
            "tasks": tasks,
            "risk": risk,
        }))
    };

    match snapshot.await {
        Ok(data) => ok(data),
        Err(e) => failure(e),
    }
}

async fn close_session(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    match state.orchestrator.close_session(session_id).await {
        Ok(archived) => ok(serde_json::json!({
            "session_id": session_id,
            "digest": archived.digest,
            "archived_at": archived.archived_at,
            "final_risk": archived.final_risk,
            "metrics": archived.metrics,
        })),
        Err(e) => failure(e),
    }
}

async fn get_archive(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    let lookup = async {
        let archived = state.orchestrator.archived_session(session_id).await?;
        let verified = state.orchestrator.verify_archive(session_id).await?;
        Ok::<_, InvestigationError>(serde_json::json!({
            "archive": archived,
            "verified": verified,
        }))
    };

    match lookup.await {
        Ok(data) => ok(data),
        Err(e) => failure(e),
    }
}

async fn session_metrics(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e),
    };

    match state.orchestrator.metrics(session_id).await {
        Ok(metrics) => ok(metrics),
        Err(e) => failure(e),
    }
}

/// =============================
/// Memory Endpoints
/// =============================

async fn list_patterns(
    State(state): State<ApiState>,
    Query(params): Query<PatternQuery>,
) -> ApiResult {
    match state.orchestrator.patterns(&params.query).await {
        Ok(records) => ok(records),
        Err(e) => failure(e),
    }
}

async fn learn_pattern(
    State(state): State<ApiState>,
    Json(req): Json<LearnRequest>,
) -> ApiResult {
    info!(kind = %req.kind, terms = ?req.terms, "Learn pattern request");

    match state
        .orchestrator
        .learn_pattern(req.kind, &req.terms, req.value, req.confidence)
        .await
    {
        Ok(record) => (StatusCode::CREATED, Json(ApiResponse::success(record))),
        Err(e) => failure(e),
    }
}

async fn get_entity(State(state): State<ApiState>, Path(name): Path<String>) -> ApiResult {
    match state.orchestrator.entity_reputation(&name).await {
        Ok(reputation) => ok(reputation),
        Err(e) => failure(e),
    }
}

async fn record_entity(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<EntityRequest>,
) -> ApiResult {
    match state
        .orchestrator
        .record_entity(&name, req.risk_score, req.sanctions_status, req.adverse_media)
        .await
    {
        Ok(reputation) => ok(reputation),
        Err(e) => failure(e),
    }
}

/// =============================
/// Event Streams
/// =============================

fn to_sse(item: StreamItem) -> SseEvent {
    match item {
        StreamItem::Event(event) => {
            let data = serde_json::to_string(&event).unwrap_or_else(|e| {
                warn!(sequence = event.sequence, error = %e, "Event serialization failed");
                "{}".to_string()
            });
            SseEvent::default()
                .event(event.payload.name())
                .id(event.sequence.to_string())
                .data(data)
        }
        StreamItem::Gap {
            session_id,
            missed_from,
        } => SseEvent::default().event("gap").data(
            serde_json::json!({
                "session_id": session_id,
                "missed_from": missed_from,
            })
            .to_string(),
        ),
    }
}

fn sse_response(
    subscription: EventSubscription,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let events = subscription
        .into_stream()
        .map(|item| Ok::<_, Infallible>(to_sse(item)));

    Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(10))
            .text("keepalive"),
    )
}

async fn stream_events(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let session_id = match parse_session_id(&id) {
        Ok(id) => id,
        Err(e) => return failure(e).into_response(),
    };

    match state.orchestrator.subscribe(session_id).await {
        Ok(subscription) => sse_response(subscription).into_response(),
        Err(e) => failure(e).into_response(),
    }
}

async fn investigate(
    State(state): State<ApiState>,
    Json(req): Json<InvestigateRequest>,
) -> Response {
    info!(query = %req.query, answers = req.answers.len(), "Streaming investigation request");

    match state.orchestrator.investigate(&req.query, &req.answers).await {
        Ok(subscription) => {
            info!(session_id = %subscription.session_id(), "Streaming investigation started");
            sse_response(subscription).into_response()
        }
        Err(e) => failure(e).into_response(),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/health", get(health))
        .route("/api/investigate", post(investigate))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(close_session))
        .route("/api/sessions/:id/answers", post(submit_answer))
        .route("/api/sessions/:id/dispatch", post(dispatch_session))
        .route("/api/sessions/:id/abort", post(abort_session))
        .route("/api/sessions/:id/events", get(stream_events))
        .route("/api/sessions/:id/metrics", get(session_metrics))
        .route("/api/archive/:id", get(get_archive))
        .route("/api/memory/patterns", get(list_patterns))
        .route("/api/memory/learn", post(learn_pattern))
        .route("/api/memory/entities/:name", get(get_entity).put(record_entity))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    orchestrator: Arc<Orchestrator>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(orchestrator);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OrchestratorConfig, RunnerConfig};
    use crate::memory::InMemoryPatternMemory;
    use crate::questions::TemplateQuestionGenerator;
    use crate::risk::RiskModel;
    use crate::specialists::scripted::ScriptedSpecialist;
    use crate::specialists::SpecialistRegistry;
    use crate::state::InMemoryContextStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn router() -> Router {
        let mut registry = SpecialistRegistry::new();
        registry.register(Arc::new(ScriptedSpecialist::scoring(
            SpecialistKind::TransactionPattern,
            82.0,
        )));
        registry.register(Arc::new(ScriptedSpecialist::scoring(
            SpecialistKind::GeographicRouting,
            70.0,
        )));

        let orchestrator = Orchestrator::new(
            Box::new(InMemoryContextStore::new()),
            Box::new(TemplateQuestionGenerator),
            registry,
            Some(Arc::new(InMemoryPatternMemory::new())),
            RiskModel::default(),
            RunnerConfig {
                default_timeout: Duration::from_secs(2),
                kind_timeouts: HashMap::new(),
                max_retries: 1,
                retry_backoff: Duration::from_millis(10),
                cancel_grace: Duration::from_millis(50),
            },
            OrchestratorConfig {
                session_timeout: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(3600),
                event_buffer: 256,
                question_timeout: Duration::from_millis(100),
                memory_timeout: Duration::from_millis(500),
                pattern_confidence_threshold: 0.7,
                archive_capacity: 100,
            },
        );
        create_router(Arc::new(orchestrator))
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(json) => request.body(Body::from(json.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn envelope(body: &str) -> ApiResponse {
        serde_json::from_str(body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&router(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("healthy"));
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let router = router();

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/sessions",
            Some(serde_json::json!({"query": "wire transfer to Cyprus"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let data = envelope(&body).data.unwrap();
        let id = data["session_id"].as_str().unwrap().to_string();
        assert_eq!(data["questions"].as_array().unwrap().len(), 4);
        assert_eq!(data["stage"], "collecting-context");

        let (status, body) = call(
            &router,
            Method::POST,
            &format!("/api/sessions/{}/answers", id),
            Some(serde_json::json!({"answer": "Import/Export business"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope(&body).data.unwrap()["answers"].as_array().unwrap().len(), 1);

        let (status, body) = call(&router, Method::POST, &format!("/api/sessions/{}/dispatch", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let dispatched = envelope(&body).data.unwrap()["dispatched"].clone();
        assert_eq!(dispatched, serde_json::json!(["geographic-routing", "transaction-pattern"]));

        // attaching after dispatch replays history and ends at the terminal event
        let (status, body) = call(&router, Method::GET, &format!("/api/sessions/{}/events", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("event: session_started"));
        assert!(body.contains("event: session_complete"));

        let (status, body) = call(&router, Method::GET, &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let data = envelope(&body).data.unwrap();
        assert_eq!(data["session"]["stage"], "complete");
        assert_eq!(data["tasks"].as_array().unwrap().len(), 2);
        assert_eq!(data["risk"]["overall_score"], 38.0);

        let (status, body) = call(&router, Method::DELETE, &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(envelope(&body).data.unwrap()["digest"].as_str().unwrap().len() == 64);

        let (status, body) = call(&router, Method::GET, &format!("/api/archive/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope(&body).data.unwrap()["verified"], true);

        let (status, body) = call(&router, Method::GET, &format!("/api/sessions/{}/metrics", id), None).await;
        assert_eq!(status, StatusCode::OK);
        let metrics = envelope(&body).data.unwrap();
        assert_eq!(metrics["agents_spawned"], 2);
        assert_eq!(metrics["succeeded"], 2);
        assert_eq!(metrics["tasks"].as_array().unwrap().len(), 2);

        let (status, _) = call(&router, Method::GET, &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let router = router();

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/sessions",
            Some(serde_json::json!({"query": "   "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!envelope(&body).success);

        let (status, _) = call(&router, Method::GET, "/api/sessions/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&router, Method::POST, &format!("/api/sessions/{}/abort", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_abort_twice_conflicts() {
        let router = router();
        let (_, body) = call(
            &router,
            Method::POST,
            "/api/sessions",
            Some(serde_json::json!({"query": "cash deposits"})),
        )
        .await;
        let id = envelope(&body).data.unwrap()["session_id"].as_str().unwrap().to_string();

        let (status, body) = call(&router, Method::POST, &format!("/api/sessions/{}/abort", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope(&body).data.unwrap()["provisional"], true);

        let (status, _) = call(&router, Method::POST, &format!("/api/sessions/{}/abort", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_investigate_streams_until_complete() {
        let router = router();

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/investigate",
            Some(serde_json::json!({
                "query": "cash deposits",
                "answers": ["Multiple deposits just under $10,000"],
            })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let first = body.find("event: session_started").unwrap();
        let dispatched = body.find("event: dispatch_decided").unwrap();
        let complete = body.find("event: session_complete").unwrap();
        assert!(first < dispatched && dispatched < complete);
        assert!(body.contains("id: 1\n"));

        let (status, body) = call(&router, Method::GET, "/api/memory/patterns?query=cash", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope(&body).data.unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_learn_and_entities() {
        let router = router();

        let (status, body) = call(
            &router,
            Method::POST,
            "/api/memory/learn",
            Some(serde_json::json!({
                "kind": "geographic-routing",
                "terms": ["Labuan", "wire"],
                "value": {"note": "round-trip wires through Labuan"},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let key = envelope(&body).data.unwrap()["key"].as_str().unwrap().to_string();
        assert!(key.starts_with("pattern:geographic-routing:labuan-wire-"));

        let (_, body) = call(&router, Method::GET, "/api/memory/patterns?query=labuan", None).await;
        assert_eq!(envelope(&body).data.unwrap()[0]["key"], key.as_str());

        let (status, _) = call(
            &router,
            Method::POST,
            "/api/memory/learn",
            Some(serde_json::json!({"kind": "geographic-routing", "terms": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&router, Method::GET, "/api/memory/entities/Globex", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &router,
            Method::PUT,
            "/api/memory/entities/Globex",
            Some(serde_json::json!({"risk_score": 77.0, "sanctions_status": "clear"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&router, Method::GET, "/api/memory/entities/globex", None).await;
        assert_eq!(status, StatusCode::OK);
        let data = envelope(&body).data.unwrap();
        assert_eq!(data["entity_name"], "Globex");
        assert_eq!(data["risk_score"], 77.0);
        assert_eq!(data["investigation_count"], 1);
    }
}
