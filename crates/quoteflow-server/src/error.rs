//! HTTP mapping of core errors.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use quoteflow_core::CoreError;
use serde_json::json;

/// Error returned by handlers; any component error converts into it.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl<E> From<E> for ApiError
where
    E: Into<CoreError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::JobNotFound(_) | CoreError::NotConnected(_) => StatusCode::NOT_FOUND,
            CoreError::CapacityExceeded(_) => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::Configuration(_) => StatusCode::BAD_REQUEST,
            CoreError::TransientUpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            CoreError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if self.0.is_rejection() {
            tracing::debug!(status = status.as_u16(), error = %self.0, "Request rejected");
        } else if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "Request failed");
        }

        let body = json!({
            "error": self.0.to_string(),
            "transient": self.0.is_transient(),
        });
        (status, Json(body)).into_response()
    }
}
