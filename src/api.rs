//! HTTP status api polled by the web dashboard.

use std::sync::Arc;

use axum::{
    extract::{self, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{
    config::{ApiConfig, Param},
    state::{CancelResult, State, TransferId, TransferStatus},
    telegram::VideoRef,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramStatus {
    pub connected: bool,
    pub bot_username: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub chat_id: String,
    pub message_id: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct TransferStarted {
    pub message: String,
    pub transfer_id: TransferId,
}

pub fn build_router(state: Arc<State>) -> Router {
    Router::new()
        .route("/api/telegram/status", get(telegram_status))
        .route("/api/transfer/start", post(start_transfer))
        .route("/api/transfer/status", get(transfer_status))
        .route(
            "/api/transfer/{transfer_id}",
            get(get_transfer).delete(cancel_transfer),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve<C: Param<ApiConfig>>(cfg: &C, state: Arc<State>) -> anyhow::Result<()> {
    let api_config = cfg.param();
    let listener = tokio::net::TcpListener::bind(&api_config.listen).await?;
    tracing::warn!("CORS allows all origins - not recommended for production");
    tracing::info!("Status api listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn telegram_status(
    extract::State(state): extract::State<Arc<State>>,
) -> Result<Json<TelegramStatus>, ApiError> {
    let username = state
        .messenger
        .username()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(TelegramStatus {
        connected: !username.is_empty(),
        bot_username: username,
    }))
}

async fn start_transfer(
    extract::State(state): extract::State<Arc<State>>,
    Json(request): Json<TransferRequest>,
) -> Result<Json<TransferStarted>, ApiError> {
    let video = match resolve_video(&state, &request) {
        Ok(video) => video,
        Err(e) => {
            tracing::warn!("Reject transfer request for chat {}: {e}", request.chat_id);
            state
                .transfers
                .record_failure(TransferStatus::error(e.to_string()));
            return Err(e);
        }
    };

    let (transfer_id, _detached) = state.spawn_transfer(video);
    tracing::info!("Transfer {transfer_id} started from api");
    Ok(Json(TransferStarted {
        message: "Transfer started".to_string(),
        transfer_id,
    }))
}

fn resolve_video(state: &State, request: &TransferRequest) -> Result<VideoRef, ApiError> {
    let chat_id: i64 = request
        .chat_id
        .trim()
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid chat_id {:?}", request.chat_id)))?;
    state
        .inbox
        .find(chat_id, request.message_id)
        .ok_or_else(|| match request.message_id {
            Some(message_id) => ApiError::NotFound(format!(
                "message {message_id} in chat {chat_id} is not a known video"
            )),
            None => ApiError::NotFound(format!("no video received from chat {chat_id}")),
        })
}

async fn transfer_status(
    extract::State(state): extract::State<Arc<State>>,
) -> Json<TransferStatus> {
    Json(state.transfers.latest())
}

async fn get_transfer(
    extract::State(state): extract::State<Arc<State>>,
    Path(transfer_id): Path<TransferId>,
) -> Result<Json<TransferStatus>, ApiError> {
    state
        .transfers
        .get(&transfer_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("transfer {transfer_id} not found")))
}

async fn cancel_transfer(
    extract::State(state): extract::State<Arc<State>>,
    Path(transfer_id): Path<TransferId>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.transfers.cancel(&transfer_id) {
        CancelResult::Cancelled => {
            tracing::info!("Transfer {transfer_id} cancelled from api");
            Ok(Json(json!({ "message": "Transfer cancelled" })))
        }
        CancelResult::NotFound => Err(ApiError::NotFound(format!(
            "transfer {transfer_id} not found"
        ))),
        CancelResult::Finished => Err(ApiError::Conflict(format!(
            "transfer {transfer_id} already finished"
        ))),
    }
}
