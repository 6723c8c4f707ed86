use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ServerConfig;
use crate::content::StageOverview;
use crate::database::{Channel, GuideDatabase, NewProfile, ReflectionEntry, UserProfile, WeeklyPractice};
use crate::error::GuideError;
use crate::llm_client::Usage;
use crate::pipeline::TurnPipeline;
use crate::progress::{CompletionOutcome, EpisodeView, ProgressService};
use crate::runtime::BackendRuntime;
use crate::stage::StageContext;
use crate::telegram::{handle_update, MessagingBridge, Update};

const TELEGRAM_SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

#[derive(Clone)]
pub struct ServerState {
    pub db: Arc<GuideDatabase>,
    pub pipeline: TurnPipeline,
    pub progress: ProgressService,
    pub auth: BackendAuthConfig,
    pub bridge: Option<Arc<dyn MessagingBridge>>,
    pub webhook_secret: Option<String>,
    pub cron_secret: Option<String>,
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

type ApiError = (StatusCode, String);

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    user_id: String,
    message: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    usage: Option<Usage>,
    fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LinkTelegramRequest {
    telegram_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StageResponse {
    #[serde(flatten)]
    stage: StageContext,
    unlocked_weeks: Vec<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveReflectionRequest {
    text: String,
    #[serde(default)]
    question: Option<String>,
}

#[derive(Debug, Serialize)]
struct ReflectionResponse {
    reflection: Option<ReflectionEntry>,
}

#[derive(Debug, Serialize)]
struct PracticesResponse {
    practices: Vec<WeeklyPractice>,
}

#[derive(Debug, Deserialize)]
struct SetPracticeDayRequest {
    day: usize,
    completed: bool,
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    ok: bool,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    deleted: usize,
    cutoff: DateTime<Utc>,
}

pub async fn serve_backend(mut runtime: BackendRuntime) -> Result<()> {
    let bind_addr = runtime
        .config
        .server
        .bind
        .parse::<SocketAddr>()
        .context("Invalid server bind address (expected host:port)")?;

    let auth = load_auth_config(&runtime.config.server)?;
    runtime.spawn_background();

    let state = Arc::new(ServerState {
        db: runtime.db.clone(),
        pipeline: runtime.pipeline.clone(),
        progress: runtime.progress.clone(),
        auth,
        bridge: runtime
            .telegram
            .clone()
            .map(|bridge| bridge as Arc<dyn MessagingBridge>),
        webhook_secret: runtime.config.telegram.webhook_secret.clone(),
        cron_secret: runtime.config.server.cron_secret.clone(),
        retention_days: runtime.config.retention_days,
    });

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Inner path backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/chat", post(chat))
        .route("/users", post(create_user))
        .route("/users/:id", get(get_user))
        .route("/users/:id/telegram", post(link_telegram))
        .route("/users/:id/stage", get(get_stage))
        .route("/users/:id/episodes/:n", get(open_episode))
        .route("/users/:id/episodes/:n/complete", post(complete_episode))
        .route(
            "/users/:id/reflections/:n",
            get(get_reflection).post(save_reflection),
        )
        .route("/users/:id/weeks/:w/practices", get(list_practices))
        .route("/users/:id/weeks/:w/practices/:p", post(set_practice_day))
        .route("/weeks/:w", get(week_overview))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // These carry their own secrets.
    let hooks = Router::new()
        .route("/telegram/webhook", post(telegram_webhook))
        .route("/cron/cleanup", post(cron_cleanup))
        .with_state(state);

    Router::new().nest("/v1", protected.merge(hooks))
}

pub fn load_auth_config(server: &ServerConfig) -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(Some(server.auth_mode.clone()))?;
    let token = server
        .token
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "INNERPATH_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid INNERPATH_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    match auth.token.as_deref() {
        Some(token) => bearer_matches(headers, token),
        None => Err(StatusCode::UNAUTHORIZED),
    }
}

fn bearer_matches(headers: &HeaderMap, token: &str) -> Result<(), StatusCode> {
    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    if auth_value.trim() != format!("Bearer {}", token) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn guide_error(error: GuideError) -> ApiError {
    let status = match &error {
        GuideError::UnknownUser(_) | GuideError::ContentNotFound(_) => StatusCode::NOT_FOUND,
        GuideError::InvalidInput(_)
        | GuideError::ReflectionTooLong { .. }
        | GuideError::ReflectionMissing(_)
        | GuideError::ContentLocked { .. } => StatusCode::BAD_REQUEST,
        GuideError::GenerationFailed(_) => StatusCode::BAD_GATEWAY,
        GuideError::StaleState { .. }
        | GuideError::PersistenceWriteFailed(_)
        | GuideError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        tracing::error!("Request failed ({}): {}", error.kind(), error);
    }
    (status, error.to_string())
}

fn internal_error(error: anyhow::Error) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

fn not_found(message: String) -> ApiError {
    (StatusCode::NOT_FOUND, message)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn chat(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let reply = state
        .pipeline
        .handle_message(&body.user_id, Channel::Web, &body.message)
        .await
        .map_err(guide_error)?;
    Ok(Json(ChatResponse {
        response: reply.text,
        usage: reply.usage,
        fallback: reply.fallback,
        details: reply.diagnostic,
    }))
}

async fn create_user(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<NewProfile>,
) -> Result<Json<UserProfile>, ApiError> {
    if body.user_id.trim().is_empty() || body.name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "user_id and name are required".to_string(),
        ));
    }
    state
        .db
        .create_profile(&body)
        .map(Json)
        .map_err(internal_error)
}

async fn get_user(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<UserProfile>, ApiError> {
    match state.db.get_profile(&user_id).map_err(internal_error)? {
        Some(profile) => Ok(Json(profile)),
        None => Err(not_found(format!("user '{}' not found", user_id))),
    }
}

async fn link_telegram(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
    Json(body): Json<LinkTelegramRequest>,
) -> Result<Json<UserProfile>, ApiError> {
    let telegram_id = body.telegram_id.trim();
    if telegram_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "telegramId is required".to_string()));
    }
    if !state
        .db
        .link_telegram_id(&user_id, telegram_id)
        .map_err(internal_error)?
    {
        return Err(not_found(format!("user '{}' not found", user_id)));
    }
    get_user(State(state), Path(user_id)).await
}

async fn get_stage(
    State(state): State<Arc<ServerState>>,
    Path(user_id): Path<String>,
) -> Result<Json<StageResponse>, ApiError> {
    let (stage, unlocked_weeks) = state
        .progress
        .stage_summary(&user_id)
        .map_err(guide_error)?;
    Ok(Json(StageResponse {
        stage,
        unlocked_weeks,
    }))
}

async fn open_episode(
    State(state): State<Arc<ServerState>>,
    Path((user_id, episode)): Path<(String, u32)>,
) -> Result<Json<EpisodeView>, ApiError> {
    state
        .progress
        .open_episode(&user_id, episode)
        .await
        .map(Json)
        .map_err(guide_error)
}

async fn complete_episode(
    State(state): State<Arc<ServerState>>,
    Path((user_id, episode)): Path<(String, u32)>,
) -> Result<Json<CompletionOutcome>, ApiError> {
    state
        .progress
        .complete_episode(&user_id, episode)
        .map(Json)
        .map_err(guide_error)
}

async fn get_reflection(
    State(state): State<Arc<ServerState>>,
    Path((user_id, episode)): Path<(String, u32)>,
) -> Result<Json<ReflectionResponse>, ApiError> {
    let reflection = state
        .progress
        .get_reflection(&user_id, episode)
        .map_err(guide_error)?;
    Ok(Json(ReflectionResponse { reflection }))
}

async fn save_reflection(
    State(state): State<Arc<ServerState>>,
    Path((user_id, episode)): Path<(String, u32)>,
    Json(body): Json<SaveReflectionRequest>,
) -> Result<Json<ReflectionResponse>, ApiError> {
    let reflection = state
        .progress
        .save_reflection(&user_id, episode, body.question.as_deref(), &body.text)
        .map_err(guide_error)?;
    Ok(Json(ReflectionResponse {
        reflection: Some(reflection),
    }))
}

async fn list_practices(
    State(state): State<Arc<ServerState>>,
    Path((user_id, week)): Path<(String, u32)>,
) -> Result<Json<PracticesResponse>, ApiError> {
    let practices = state
        .progress
        .list_practices(&user_id, week)
        .map_err(guide_error)?;
    Ok(Json(PracticesResponse { practices }))
}

async fn set_practice_day(
    State(state): State<Arc<ServerState>>,
    Path((user_id, week, practice)): Path<(String, u32, u32)>,
    Json(body): Json<SetPracticeDayRequest>,
) -> Result<Json<WeeklyPractice>, ApiError> {
    state
        .progress
        .set_practice_day(&user_id, week, practice, body.day, body.completed)
        .map(Json)
        .map_err(guide_error)
}

async fn week_overview(
    State(state): State<Arc<ServerState>>,
    Path(week): Path<u32>,
) -> Result<Json<StageOverview>, ApiError> {
    state
        .progress
        .week_overview(week)
        .await
        .map(Json)
        .map_err(guide_error)
}

/// Always acknowledges, so Telegram never retries a delivered update.
async fn telegram_webhook(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Json<WebhookAck> {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let presented = headers
            .get(TELEGRAM_SECRET_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != secret {
            tracing::warn!("Telegram webhook called with a wrong secret token; update dropped");
            return Json(WebhookAck { ok: true });
        }
    }

    match serde_json::from_value::<Update>(body) {
        Ok(update) => match state.bridge.as_deref() {
            Some(bridge) => {
                handle_update(&state.pipeline, bridge, update).await;
            }
            None => tracing::warn!("Telegram webhook hit but no bot token is configured"),
        },
        Err(e) => tracing::warn!("Telegram webhook: unreadable update: {}", e),
    }
    Json(WebhookAck { ok: true })
}

async fn cron_cleanup(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<CleanupResponse>, ApiError> {
    let Some(secret) = state.cron_secret.as_deref() else {
        return Err((StatusCode::UNAUTHORIZED, "cron secret not configured".to_string()));
    };
    bearer_matches(&headers, secret).map_err(|status| (status, "unauthorized".to_string()))?;

    let cutoff = Utc::now() - Duration::days(state.retention_days);
    let deleted = state
        .db
        .delete_turns_older_than(cutoff)
        .map_err(internal_error)?;
    tracing::info!("Retention sweep removed {} turns older than {}", deleted, cutoff);
    Ok(Json(CleanupResponse { deleted, cutoff }))
}
