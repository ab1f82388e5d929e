use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::response;
use crate::api::AppState;
use feedmesh::error::FeedError;
use feedmesh::feed::models::{FeedId, SubfeedHash};

/// Maximum messages accepted in one append request.
const MAX_APPEND_BATCH: usize = 1000;

#[derive(Deserialize, Default)]
pub struct CreateFeedRequest {
    #[serde(default)]
    pub feed_name: Option<String>,
}

#[derive(Serialize)]
pub struct FeedIdResponse {
    pub feed_id: FeedId,
}

#[derive(Deserialize)]
pub struct AppendRequest {
    pub messages: Vec<serde_json::Value>,
    #[serde(default)]
    pub meta_data: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct MessageCountResponse {
    pub feed_id: FeedId,
    pub subfeed_hash: SubfeedHash,
    pub message_count: u64,
}

fn parse_feed_id(feed_id: &str) -> Result<FeedId, Response> {
    FeedId::parse(feed_id).map_err(response::from_error)
}

fn parse_subfeed(feed_id: &str, subfeed_hash: &str) -> Result<(FeedId, SubfeedHash), Response> {
    let feed_id = parse_feed_id(feed_id)?;
    let subfeed_hash = SubfeedHash::parse(subfeed_hash).map_err(response::from_error)?;
    Ok((feed_id, subfeed_hash))
}

pub async fn create_feed(
    State(state): State<AppState>,
    body: Option<Json<CreateFeedRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    if req.feed_name.as_deref().is_some_and(|n| n.trim().is_empty()) {
        return response::err::<()>(StatusCode::BAD_REQUEST, "INVALID_NAME", "feed_name is empty")
            .into_response();
    }
    match state.manager.create_feed(req.feed_name).await {
        Ok(feed_id) => (StatusCode::CREATED, response::ok(FeedIdResponse { feed_id })).into_response(),
        Err(e) => response::from_error(e),
    }
}

pub async fn delete_feed(State(state): State<AppState>, Path(feed_id): Path<String>) -> Response {
    let feed_id = match parse_feed_id(&feed_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match state.manager.delete_feed(&feed_id).await {
        Ok(true) => response::ok(FeedIdResponse { feed_id }).into_response(),
        Ok(false) => response::from_error(FeedError::FeedNotFound {
            feed_id: feed_id.to_string(),
        }),
        Err(e) => response::from_error(e),
    }
}

pub async fn get_feed_info(State(state): State<AppState>, Path(feed_id): Path<String>) -> Response {
    let feed_id = match parse_feed_id(&feed_id) {
        Ok(id) => id,
        Err(r) => return r,
    };
    match state.manager.get_feed_info(&feed_id).await {
        Ok(info) => response::ok(info).into_response(),
        Err(e) => response::from_error(e),
    }
}

pub async fn get_feed_id_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    match state.manager.get_feed_id(&name).await {
        Ok(Some(feed_id)) => response::ok(FeedIdResponse { feed_id }).into_response(),
        Ok(None) => response::err::<()>(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            &format!("no feed named {name:?}"),
        )
        .into_response(),
        Err(e) => response::from_error(e),
    }
}

pub async fn append_messages(
    State(state): State<AppState>,
    Path((feed_id, subfeed_hash)): Path<(String, String)>,
    Json(req): Json<AppendRequest>,
) -> Response {
    let (feed_id, subfeed_hash) = match parse_subfeed(&feed_id, &subfeed_hash) {
        Ok(ids) => ids,
        Err(r) => return r,
    };
    if req.messages.len() > MAX_APPEND_BATCH {
        return response::err::<()>(
            StatusCode::PAYLOAD_TOO_LARGE,
            "BATCH_TOO_LARGE",
            &format!("at most {MAX_APPEND_BATCH} messages per request"),
        )
        .into_response();
    }

    match state
        .manager
        .append_messages(&feed_id, &subfeed_hash, req.messages, req.meta_data)
        .await
    {
        Ok(message_count) => (
            StatusCode::CREATED,
            response::ok(MessageCountResponse {
                feed_id,
                subfeed_hash,
                message_count,
            }),
        )
            .into_response(),
        Err(e) => response::from_error(e),
    }
}

pub async fn get_message_count(
    State(state): State<AppState>,
    Path((feed_id, subfeed_hash)): Path<(String, String)>,
) -> Response {
    let (feed_id, subfeed_hash) = match parse_subfeed(&feed_id, &subfeed_hash) {
        Ok(ids) => ids,
        Err(r) => return r,
    };
    match state
        .manager
        .get_num_local_messages(&feed_id, &subfeed_hash)
        .await
    {
        Ok(message_count) => response::ok(MessageCountResponse {
            feed_id,
            subfeed_hash,
            message_count,
        })
        .into_response(),
        Err(e) => response::from_error(e),
    }
}
