//! HTTP API: localhost-only REST surface over the feed manager.
//!
//! Binding to 127.0.0.1 happens in main.rs. There is no authentication on the
//! HTTP layer; the loopback interface is the security boundary.

pub mod response;
pub mod routes_feeds;
pub mod routes_status;
pub mod routes_watch;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;

use feedmesh::config::Config;
use feedmesh::feed::FeedManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<FeedManager>,
    pub config: Arc<Config>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(routes_status::get_status))
        .route("/v1/feeds", post(routes_feeds::create_feed))
        .route(
            "/v1/feeds/:feed_id",
            get(routes_feeds::get_feed_info).delete(routes_feeds::delete_feed),
        )
        .route("/v1/feed-names/:name", get(routes_feeds::get_feed_id_by_name))
        .route(
            "/v1/feeds/:feed_id/subfeeds/:subfeed_hash/messages",
            post(routes_feeds::append_messages),
        )
        .route(
            "/v1/feeds/:feed_id/subfeeds/:subfeed_hash/count",
            get(routes_feeds::get_message_count),
        )
        .route("/v1/watch", post(routes_watch::watch_for_new_messages))
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024)) // 4 MB
        .with_state(state)
}
