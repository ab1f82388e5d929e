use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::api::response;
use crate::api::AppState;
use feedmesh::feed::ManagerStatus;

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_label: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub manager: ManagerStatus,
}

pub async fn get_status(State(state): State<AppState>) -> Response {
    match state.manager.status().await {
        Ok(manager) => response::ok(StatusResponse {
            node_label: state.config.node_label.clone(),
            version: env!("CARGO_PKG_VERSION"),
            uptime_secs: state.started_at.elapsed().as_secs(),
            manager,
        })
        .into_response(),
        Err(e) => response::from_error(e),
    }
}
