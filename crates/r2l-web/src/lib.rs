//! Axum surface for r2l: trigger a sync over HTTP and run the Last.fm auth handshake.

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use r2l_adapters::{auth_url, LastFmClient, ScrobbleError};
use r2l_sync::{
    load_session, maybe_build_scheduler, save_session, SharedSession, SyncConfig, SyncError, SyncOutcome,
    SyncPipeline,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "r2l-web";

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<SyncPipeline>,
    pub session: SharedSession,
    pub lastfm: LastFmClient,
    pub session_path: PathBuf,
    pub callback_url: String,
}

impl AppState {
    pub async fn from_config(config: &SyncConfig) -> anyhow::Result<Self> {
        let session = load_session(config).await?;
        let http = config.http_client()?;
        Ok(Self {
            pipeline: Arc::new(SyncPipeline::from_config(config)?),
            session: Arc::new(RwLock::new(session)),
            lastfm: LastFmClient::new(http, config.lastfm_api_url.clone()),
            session_path: config.session_path.clone(),
            callback_url: config.callback_url(),
        })
    }
}

#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub message: String,
    pub pages: usize,
    pub reported: usize,
    pub responses: Vec<JsonValue>,
    pub cursor: Option<i64>,
}

impl From<SyncOutcome> for ExportResponse {
    fn from(outcome: SyncOutcome) -> Self {
        Self {
            message: outcome.message,
            pages: outcome.batches,
            reported: outcome.reported,
            responses: outcome.responses,
            cursor: outcome.cursor,
        }
    }
}

#[derive(Debug, Serialize)]
struct SyncErrorBody {
    error: String,
    stage: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    batch: Option<usize>,
    retryable: bool,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    token: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/export/{source_id}/{game}", get(export_handler))
        .route("/lfm/login", get(login_handler))
        .route("/lfm/callback", get(callback_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env();
    let state = AppState::from_config(&config).await?;
    let scheduler = maybe_build_scheduler(&config, state.pipeline.clone(), state.session.clone()).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "scheduler started");
    }
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let sources: Vec<&str> = state.pipeline.source_ids().collect();
    let authorized = state.session.read().await.is_authorized();
    Json(json!({ "status": "ok", "sources": sources, "authorized": authorized }))
}

async fn export_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((source_id, game)): AxumPath<(String, String)>,
) -> Response {
    let session = state.session.read().await.clone();
    match state.pipeline.run_once(&session, &source_id, &game).await {
        Ok(outcome) => Json(ExportResponse::from(outcome)).into_response(),
        Err(err) => sync_error_response(&err),
    }
}

async fn login_handler(State(state): State<Arc<AppState>>) -> Response {
    let api_key = state.session.read().await.api_key.clone();
    match auth_url(&api_key, &state.callback_url) {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err),
    }
}

async fn callback_handler(State(state): State<Arc<AppState>>, Query(query): Query<CallbackQuery>) -> Response {
    let Some(token) = query.token.filter(|t| !t.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "missing token query parameter");
    };

    let current = state.session.read().await.clone();
    let (updated, info) = match state.lastfm.get_session(&current, &token).await {
        Ok(granted) => granted,
        Err(err) => {
            warn!(error = %err, "Last.fm session handshake failed");
            return error_response(scrobble_error_status(&err), err);
        }
    };

    if let Err(err) = save_session(&state.session_path, &updated).await {
        warn!(error = %err, "session not persisted; it is kept in memory until restart");
    }
    *state.session.write().await = updated;
    info!(user = %info.name, "Last.fm session updated");
    Json(json!({ "message": format!("Authenticated as {}.", info.name), "name": info.name })).into_response()
}

fn scrobble_error_status(err: &ScrobbleError) -> StatusCode {
    match err {
        ScrobbleError::MissingSessionKey => StatusCode::UNAUTHORIZED,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn sync_error_status(err: &SyncError) -> StatusCode {
    match err {
        SyncError::UnknownSource(_) => StatusCode::NOT_FOUND,
        SyncError::Fetch { .. } => StatusCode::BAD_GATEWAY,
        SyncError::Submission { source, .. } => scrobble_error_status(source),
        SyncError::CursorLoad { .. } | SyncError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn sync_error_response(err: &SyncError) -> Response {
    let body = SyncErrorBody {
        error: err.to_string(),
        stage: err.stage().as_str(),
        batch: err.batch(),
        retryable: err.retryable(),
    };
    (sync_error_status(err), Json(body)).into_response()
}

fn error_response(status: StatusCode, err: impl Display) -> Response {
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
