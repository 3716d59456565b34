//! `POST /v1/messages`: authenticate the inbound key, hand the request to
//! the orchestrator, and translate its outcome into a JSON body or a raw
//! SSE passthrough response.

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use serde_json::Value;

use crate::AppState;
use crate::domain::Platform;
use crate::orchestrator::RelayOutcome;
use crate::validator::{self, ClientType};

const MESSAGES_PATH: &str = "/api/v1/messages";

pub async fn post_messages(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let validation = validator::validate(&headers, &body, MESSAGES_PATH);
    let platform = match validation.client_type {
        ClientType::CodexCli => Platform::Codex,
        ClientType::CodeCli | ClientType::Unknown => Platform::Console,
    };

    let key = match state.key_auth.authenticate(&headers, platform).await {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    match state.orchestrator.handle_relay(&key, &headers, &body, MESSAGES_PATH).await {
        Ok(RelayOutcome::Unary(value)) => Json(value).into_response(),
        Ok(RelayOutcome::Stream(stream)) => {
            let body = Body::from_stream(stream.map(|chunk| chunk.map_err(axum::Error::new)));
            Response::builder()
                .status(StatusCode::OK)
                .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
                .header(axum::http::header::CACHE_CONTROL, "no-cache")
                .header(axum::http::header::CONNECTION, "keep-alive")
                .body(body)
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => err.into_response(),
    }
}
