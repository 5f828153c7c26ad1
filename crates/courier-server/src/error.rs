use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use courier_store::StoreError;

/// Failures of one session's transport. Always resolved locally by tearing
/// the session down; never surfaced to other sessions.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] axum::Error),

    #[error("Transport closed")]
    Closed,

    #[error("No inbound traffic for {0:?}")]
    ReadTimeout(Duration),

    #[error("Write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] courier_shared::ProtocolError),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("Message store error: {0}")]
    Store(#[from] StoreError),

    #[error("Hub is not running")]
    Unavailable,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Messaging hub unavailable")]
    HubUnavailable,
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Store(e) => ServerError::Store(e),
            HubError::Unavailable => ServerError::HubUnavailable,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Store(e) => {
                tracing::error!(error = %e, "Request failed on message store");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::HubUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
