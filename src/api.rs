//! REST API Server for the SQL assistant

use crate::config::ServerConfig;
use crate::error::AssistantError;
use crate::executor::Row;
use crate::pipeline::{Assistant, ChatOutcome, ReportOutcome};
use crate::session::{SessionSummary, Turn};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};

/// API State - Shared between handlers
#[derive(Clone)]
pub struct ApiState {
    pub assistant: Arc<Assistant>,
}

impl ApiState {
    pub fn new(assistant: Arc<Assistant>) -> Self {
        Self { assistant }
    }
}

/// Error surfaced to HTTP clients as `{"error": <public message>}`.
#[derive(Debug)]
pub struct ApiError(pub AssistantError);

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        warn!("Rejected request body: {}", rejection.body_text());
        let message = match rejection {
            JsonRejection::MissingJsonContentType(_) => "request body must be JSON",
            JsonRejection::JsonSyntaxError(_) => "request body is not valid JSON",
            _ => "request body does not match the expected fields",
        };
        ApiError(AssistantError::InvalidRequest(message.to_string()))
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AssistantError::InvalidRequest(_) | AssistantError::UnsafeQuery(_) => {
                StatusCode::BAD_REQUEST
            }
            AssistantError::Execution { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            AssistantError::Upstream(_) | AssistantError::MalformedReply(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed ({}): {}", status, self.0);
        } else {
            warn!("Request rejected ({}): {}", status, self.0);
        }
        (status, Json(json!({ "error": self.0.public_message() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Deserialize)]
pub struct ChatRequest {
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Deserialize)]
pub struct SqlRequest {
    pub sql: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub model: String,
}

#[derive(Serialize)]
pub struct GeneratedSql {
    pub sql: String,
}

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub messages: Vec<Turn>,
}

async fn health_check(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: env!("CARGO_PKG_NAME").to_string(),
        model: state.assistant.model_name().to_string(),
    })
}

async fn chat(
    State(state): State<ApiState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<ChatOutcome> {
    let Json(request) = payload?;
    let outcome = state.assistant.chat(request.session_id, &request.message).await?;
    Ok(Json(outcome))
}

async fn generate_sql(
    State(state): State<ApiState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<GeneratedSql> {
    let Json(request) = payload?;
    let sql = state.assistant.generate_sql(&request.query).await?;
    Ok(Json(GeneratedSql { sql: sql.into_inner() }))
}

async fn execute_sql(
    State(state): State<ApiState>,
    payload: Result<Json<SqlRequest>, JsonRejection>,
) -> ApiResult<Vec<Row>> {
    let Json(request) = payload?;
    let result = state.assistant.execute_sql(&request.sql).await?;
    Ok(Json(result.rows))
}

async fn report(
    State(state): State<ApiState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<ReportOutcome> {
    let Json(request) = payload?;
    let outcome = state.assistant.report(&request.query).await?;
    Ok(Json(outcome))
}

async fn list_sessions(State(state): State<ApiState>) -> ApiResult<SessionsResponse> {
    let sessions = state.assistant.sessions().await?;
    Ok(Json(SessionsResponse { sessions }))
}

async fn chat_history(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> ApiResult<HistoryResponse> {
    let messages = state.assistant.history(&session_id).await?;
    Ok(Json(HistoryResponse {
        session_id,
        messages,
    }))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("Ignoring invalid CORS origin '{}'", origin);
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the API router
pub fn create_router(state: ApiState, cors_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/chat", post(chat))
        .route("/generate-sql", post(generate_sql))
        .route("/execute-sql", post(execute_sql))
        .route("/report", post(report))
        .route("/chat_sessions", get(list_sessions))
        .route("/chat_history/:session_id", get(chat_history))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Start the API server
pub async fn start_server(config: &ServerConfig, state: ApiState) -> crate::error::Result<()> {
    let app = create_router(state, &config.cors_origins);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("SQL assistant API listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
