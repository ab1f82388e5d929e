use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use feedmesh::error::FeedError;

#[derive(Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

pub fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

pub fn err<T: Serialize>(
    status: StatusCode,
    code: &str,
    message: &str,
) -> (StatusCode, Json<ApiResponse<T>>) {
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }),
    )
}

pub fn from_error(e: FeedError) -> Response {
    let (status, code, message) = match &e {
        FeedError::InvalidId { .. } => (StatusCode::BAD_REQUEST, "INVALID_ID", e.to_string()),
        FeedError::FeedNotFound { .. } => (StatusCode::NOT_FOUND, "FEED_NOT_FOUND", e.to_string()),
        FeedError::NotWriteable { .. } => (StatusCode::FORBIDDEN, "NOT_WRITEABLE", e.to_string()),
        FeedError::UnknownChannel { .. } => {
            (StatusCode::BAD_REQUEST, "UNKNOWN_CHANNEL", e.to_string())
        }
        FeedError::SignatureInvalid
        | FeedError::FeedIntegrity { .. }
        | FeedError::PositionGap { .. } => {
            (StatusCode::CONFLICT, "FEED_INTEGRITY", e.to_string())
        }
        FeedError::Initialization { .. } => {
            tracing::warn!(error = %e, "subfeed unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "SUBFEED_UNAVAILABLE",
                e.to_string(),
            )
        }
        FeedError::Serialization(_) => {
            (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR", e.to_string())
        }
        _ => {
            tracing::warn!(error = %e, "internal error in API handler");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "an internal error occurred".to_string(),
            )
        }
    };

    err::<()>(status, code, &message).into_response()
}
