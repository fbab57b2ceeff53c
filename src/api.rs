//! REST API Server for the research orchestrator
//!
//! Research runs in background tasks; clients poll the session endpoint or
//! pass `wait: true` to block until the loop terminates.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::context::{AdminCommand, AppContext};
use crate::error::ResearchError;
use crate::models::SessionStatus;
use crate::store::LeaseGuard;

const DEFAULT_LIST_LIMIT: usize = 20;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResumeRequest {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model: String,
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

fn ok<T: Serialize>(status: StatusCode, data: T) -> ApiResult {
    (status, Json(ApiResponse::success(data)))
}

fn fail(err: ResearchError) -> ApiResult {
    let status = match &err {
        ResearchError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        ResearchError::SessionNotResumable { .. } | ResearchError::SessionBusy(_) => {
            StatusCode::CONFLICT
        }
        ResearchError::Config(_)
        | ResearchError::PlanningFailed(_)
        | ResearchError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ApiResponse::error(err.to_string())))
}

/// =============================
/// API State
/// =============================

/// Cancellation handles of loops started by this server.
///
/// Each registration carries a generation so a finished loop only ever
/// removes its own handle.
#[derive(Clone, Default)]
pub struct RunningLoops {
    tokens: Arc<Mutex<HashMap<Uuid, (u64, CancellationToken)>>>,
    generation: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl RunningLoops {
    fn register(&self, session_id: Uuid) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens.insert(session_id, (generation, token.clone()));
        (generation, token)
    }

    fn remove(&self, session_id: Uuid, generation: u64) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        if tokens.get(&session_id).map(|(g, _)| *g) == Some(generation) {
            tokens.remove(&session_id);
        }
    }

    fn cancel(&self, session_id: Uuid) -> bool {
        let tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        match tokens.get(&session_id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        for (_, token) in tokens.values() {
            token.cancel();
        }
    }

    /// Cancels every loop and waits until each has written its final records.
    pub async fn shutdown(&self) {
        self.cancel_all();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub context: Arc<AppContext>,
    pub running: RunningLoops,
}

/// Runs the loop under `lease`, inline when `wait` is set.
async fn launch(state: &ApiState, lease: LeaseGuard, wait: bool) -> ApiResult {
    let session_id = lease.session_id();
    let reflector = state.context.reflector();
    let running = state.running.clone();
    let (generation, token) = running.register(session_id);

    if wait {
        let result = reflector.run_leased(lease, &token).await;
        running.remove(session_id, generation);
        return match result {
            Ok(outcome) => ok(StatusCode::OK, outcome),
            Err(e) => fail(e),
        };
    }

    let tracker = running.tracker.clone();
    tracker.spawn(async move {
        match reflector.run_leased(lease, &token).await {
            Ok(outcome) => info!(
                session_id = %session_id,
                termination = ?outcome.termination,
                "background research finished"
            ),
            Err(e) => error!(session_id = %session_id, error = %e, "background research failed"),
        }
        running.remove(session_id, generation);
    });

    ok(
        StatusCode::ACCEPTED,
        serde_json::json!({ "session_id": session_id, "status": SessionStatus::Active }),
    )
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
/// Research Endpoints
/// =============================

async fn start_research(
    State(state): State<ApiState>,
    Json(req): Json<ResearchRequest>,
) -> ApiResult {
    info!("Received research request: {}", req.query);

    let session = match state.context.reflector().begin(&req.query).await {
        Ok(session) => session,
        Err(e) => return fail(e),
    };
    let lease = match state.context.leases().acquire(session.id) {
        Ok(lease) => lease,
        Err(e) => return fail(e),
    };

    launch(&state, lease, req.wait).await
}

async fn resume_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
    body: Option<Json<ResumeRequest>>,
) -> ApiResult {
    let req = body.map(|Json(r)| r).unwrap_or_default();

    // the lease comes first: status checks only mean something to its holder
    let lease = match state.context.leases().acquire(session_id) {
        Ok(lease) => lease,
        Err(e) => return fail(e),
    };
    let session = match state.context.store().get_session(session_id).await {
        Ok(session) => session,
        Err(e) => return fail(e),
    };
    if session.status != SessionStatus::Active {
        return fail(ResearchError::SessionNotResumable {
            id: session_id,
            status: session.status,
        });
    }

    launch(&state, lease, req.wait).await
}

async fn cancel_session(
    State(state): State<ApiState>,
    Path(session_id): Path<Uuid>,
) -> ApiResult {
    if state.running.cancel(session_id) {
        info!(session_id = %session_id, "cancellation requested");
        ok(
            StatusCode::OK,
            serde_json::json!({ "session_id": session_id, "cancelled": true }),
        )
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!(
                "no running research loop for session {}",
                session_id
            ))),
        )
    }
}

/// =============================
/// Session Endpoints
/// =============================

async fn list_sessions(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.context.admin(AdminCommand::ListSessions { limit }).await {
        Ok(reply) => ok(StatusCode::OK, reply),
        Err(e) => fail(e),
    }
}

async fn get_session(State(state): State<ApiState>, Path(session_id): Path<Uuid>) -> ApiResult {
    let store = state.context.store();
    let session = match store.get_session(session_id).await {
        Ok(session) => session,
        Err(e) => return fail(e),
    };
    let history = match store.load_history(session_id).await {
        Ok(history) => history,
        Err(e) => return fail(e),
    };

    ok(
        StatusCode::OK,
        serde_json::json!({
            "session": session,
            "running": state.context.leases().is_held(session_id),
            "history": history,
        }),
    )
}

/// =============================
/// Admin Endpoints
/// =============================

async fn run_admin(state: &ApiState, command: AdminCommand) -> ApiResult {
    match state.context.admin(command).await {
        Ok(reply) => ok(StatusCode::OK, reply),
        Err(e) => fail(e),
    }
}

async fn cache_stats(State(state): State<ApiState>) -> ApiResult {
    run_admin(&state, AdminCommand::CacheStats).await
}

async fn cache_clean(State(state): State<ApiState>) -> ApiResult {
    run_admin(&state, AdminCommand::CacheClean).await
}

async fn cache_clear(State(state): State<ApiState>) -> ApiResult {
    run_admin(&state, AdminCommand::CacheClear).await
}

async fn switch_model(
    State(state): State<ApiState>,
    Json(req): Json<ModelRequest>,
) -> ApiResult {
    run_admin(&state, AdminCommand::SwitchModel(req.model)).await
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/research", post(start_research))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id", get(get_session))
        .route("/api/sessions/:id/resume", post(resume_session))
        .route("/api/sessions/:id/cancel", post(cancel_session))
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/clean", post(cache_clean))
        .route("/api/cache", delete(cache_clear))
        .route("/api/admin/model", put(switch_model))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    context: Arc<AppContext>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let state = ApiState {
        context,
        running: RunningLoops::default(),
    };
    let running = state.running.clone();
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    let signal = running.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested; cancelling running research loops");
            }
            signal.cancel_all();
        })
        .await?;

    running.shutdown().await;
    info!("all research loops settled");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheSettings, ResearchConfig};
    use crate::models::CapabilitySet;
    use crate::providers::ProviderRegistry;
    use crate::store::InMemorySessionStore;
    use crate::testing::ScriptedProvider;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(provider: ScriptedProvider) -> ApiState {
        let config = ResearchConfig {
            database_url: "memory".to_string(),
            cache: CacheSettings {
                enabled: false,
                dir: std::env::temp_dir(),
                ttl: Duration::from_secs(60),
            },
            ..ResearchConfig::default()
        };
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider));
        let context = AppContext::assemble(config, Arc::new(InMemorySessionStore::new()), registry, None);

        ApiState {
            context: Arc::new(context),
            running: RunningLoops::default(),
        }
    }

    fn app() -> Router {
        create_router(state(ScriptedProvider::new(CapabilitySet::all())))
    }

    async fn was_interrupted(state: &ApiState, session_id: Uuid) -> bool {
        let history = state.context.store().load_history(session_id).await.unwrap();
        history.iter().filter_map(|e| e.as_message()).any(|m| {
            m.metadata
                .as_ref()
                .map_or(false, |meta| meta["event"] == "interrupted")
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&app(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_research_then_inspect_session() {
        let app = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/research",
            Some(json!({"query": "Apple Q4 revenue", "wait": true})),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "completed");
        assert!(body["data"]["answer"]
            .as_str()
            .unwrap()
            .contains("test://income-statements/AAPL"));

        let id = body["data"]["session_id"].as_str().unwrap().to_string();
        let (status, detail) = call(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["data"]["session"]["status"], "completed");
        assert_eq!(detail["data"]["history"][0]["kind"], "message");

        // completed sessions are not resumable
        let (status, body) = call(&app, "POST", &format!("/api/sessions/{}/resume", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (status, list) = call(&app, "GET", "/api/sessions?limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(list["data"]["sessions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_query_is_rejected() {
        let (status, body) =
            call(&app(), "POST", "/api/research", Some(json!({"query": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("query is empty"));
    }

    #[tokio::test]
    async fn test_unknown_session_and_idle_cancel() {
        let app = app();
        let id = Uuid::now_v7();

        let (status, _) = call(&app, "GET", &format!("/api/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, "POST", &format!("/api/sessions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_endpoints() {
        let app = app();

        let (status, body) = call(&app, "GET", "/api/cache/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["kind"], "cache_stats");

        let (status, body) = call(&app, "DELETE", "/api/cache", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["removed"], 0);

        // no language model configured
        let (status, _) = call(
            &app,
            "PUT",
            "/api/admin/model",
            Some(json!({"model": "gemini-2.5-pro"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_concurrent_resumes_share_one_loop() {
        let state = state(
            ScriptedProvider::new(CapabilitySet::all()).with_delay(Duration::from_millis(300)),
        );
        let app = create_router(state.clone());
        let session = state
            .context
            .reflector()
            .begin("Apple revenue by segment")
            .await
            .unwrap();
        let resume = format!("/api/sessions/{}/resume", session.id);

        let (first, second) = tokio::join!(
            call(&app, "POST", &resume, None),
            call(&app, "POST", &resume, None)
        );
        let mut statuses = vec![first.0, second.0];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::ACCEPTED, StatusCode::CONFLICT]);

        // the loser must not have replaced or dropped the winner's handle
        let cancel = format!("/api/sessions/{}/cancel", session.id);
        let (status, body) = call(&app, "POST", &cancel, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["cancelled"], true);

        state.running.shutdown().await;
        assert!(!state.context.leases().is_held(session.id));
        let stored = state.context.store().get_session(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
        assert!(was_interrupted(&state, session.id).await);

        let (status, _) = call(&app, "POST", &cancel, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_background_loops() {
        let state = state(
            ScriptedProvider::new(CapabilitySet::all()).with_delay(Duration::from_millis(200)),
        );
        let app = create_router(state.clone());

        let (status, body) = call(
            &app,
            "POST",
            "/api/research",
            Some(json!({"query": "Apple revenue by segment"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let session_id: Uuid = body["data"]["session_id"].as_str().unwrap().parse().unwrap();
        assert!(state.context.leases().is_held(session_id));

        state.running.shutdown().await;

        // the loop wrote its interruption record before shutdown returned
        assert!(!state.context.leases().is_held(session_id));
        assert!(was_interrupted(&state, session_id).await);
    }
}
