use std::collections::HashMap;
use std::time::Duration;

use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::response;
use crate::api::AppState;
use feedmesh::feed::SubfeedWatch;

/// Upper bound on `wait_msec`.
const MAX_WAIT_MSEC: u64 = 120_000;
const DEFAULT_MAX_MESSAGES: usize = 100;
const MAX_MESSAGES: usize = 10_000;

#[derive(Deserialize)]
pub struct WatchRequest {
    pub subfeed_watches: HashMap<String, SubfeedWatch>,
    #[serde(default)]
    pub wait_msec: u64,
    #[serde(default)]
    pub max_num_messages: Option<usize>,
    /// Return full signed entries instead of bare payloads.
    #[serde(default)]
    pub signed: bool,
}

#[derive(Serialize)]
pub struct WatchResponse {
    pub messages: HashMap<String, Vec<serde_json::Value>>,
}

pub async fn watch_for_new_messages(
    State(state): State<AppState>,
    Json(req): Json<WatchRequest>,
) -> Response {
    let wait = Duration::from_millis(req.wait_msec.min(MAX_WAIT_MSEC));
    let max_count = req
        .max_num_messages
        .unwrap_or(DEFAULT_MAX_MESSAGES)
        .clamp(1, MAX_MESSAGES);

    let found = match state
        .manager
        .watch_for_new_messages(req.subfeed_watches, wait, max_count)
        .await
    {
        Ok(found) => found,
        Err(e) => return response::from_error(e),
    };

    let mut messages = HashMap::with_capacity(found.len());
    for (name, entries) in found {
        let values = if req.signed {
            match entries
                .into_iter()
                .map(serde_json::to_value)
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(v) => v,
                Err(e) => return response::from_error(e.into()),
            }
        } else {
            entries.into_iter().map(|m| m.body.message).collect()
        };
        messages.insert(name, values);
    }
    response::ok(WatchResponse { messages }).into_response()
}
