use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::commands::{ChatBot, Inbound};
use crate::transport::MemoryTransport;
use crate::types::UserId;

/// Shared state behind the HTTP chat surface.
#[derive(Clone)]
pub struct AppState {
    bot: ChatBot,
    outbox: Arc<MemoryTransport>,
}

impl AppState {
    /// `outbox` must be the transport the bot's orchestrator sends through.
    pub fn new(bot: ChatBot, outbox: Arc<MemoryTransport>) -> Self {
        Self { bot, outbox }
    }
}

#[derive(Debug, Deserialize)]
pub struct TextMessage {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub name: String,
}

pub fn router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.bot.orchestrator().config().max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_mul(2);

    let api = Router::new()
        .route("/users/{id}/messages", post(post_message).get(get_messages))
        .route("/users/{id}/callbacks", post(post_callback))
        .route("/users/{id}/files", post(post_file))
        .route("/users/{id}/status", get(get_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("serving chat API on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn post_message(
    State(app): State<AppState>,
    Path(user): Path<UserId>,
    Json(msg): Json<TextMessage>,
) -> impl IntoResponse {
    app.bot.handle(user, Inbound::Text(msg.text)).await;
    StatusCode::ACCEPTED
}

async fn post_callback(
    State(app): State<AppState>,
    Path(user): Path<UserId>,
    Json(cb): Json<CallbackQuery>,
) -> impl IntoResponse {
    app.bot.handle(user, Inbound::Callback(cb.data)).await;
    StatusCode::ACCEPTED
}

async fn post_file(
    State(app): State<AppState>,
    Path(user): Path<UserId>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> impl IntoResponse {
    let inbound = Inbound::Document {
        file_name: params.name,
        contents: body.to_vec(),
    };
    app.bot.handle(user, inbound).await;
    StatusCode::ACCEPTED
}

async fn get_messages(State(app): State<AppState>, Path(user): Path<UserId>) -> impl IntoResponse {
    if !app.bot.access().is_allowed(user) {
        return StatusCode::FORBIDDEN.into_response();
    }
    (StatusCode::OK, Json(app.outbox.messages(user))).into_response()
}

async fn get_status(State(app): State<AppState>, Path(user): Path<UserId>) -> impl IntoResponse {
    if !app.bot.access().is_allowed(user) {
        return StatusCode::FORBIDDEN.into_response();
    }
    let snapshot = app.bot.orchestrator().session(user).snapshot();
    (StatusCode::OK, Json(snapshot)).into_response()
}
