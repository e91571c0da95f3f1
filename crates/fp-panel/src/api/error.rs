//! Mapping of `PanelError` onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use fp_core::PanelError;

/// A `PanelError` on its way out of a handler
#[derive(Debug)]
pub struct ApiError(pub PanelError);

impl From<PanelError> for ApiError {
    fn from(e: PanelError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            PanelError::NotFound(_) => StatusCode::NOT_FOUND,
            PanelError::Conflict(_) => StatusCode::CONFLICT,
            PanelError::Unauthorized => StatusCode::UNAUTHORIZED,
            PanelError::Forbidden(_) => StatusCode::FORBIDDEN,
            PanelError::Unreachable(_) | PanelError::AuthFailure(_) | PanelError::Protocol(_) => {
                StatusCode::BAD_GATEWAY
            }
            PanelError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PanelError::NodeNotTunnel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PanelError::Invalid(_) => StatusCode::BAD_REQUEST,
            PanelError::Storage(_) | PanelError::Config(_) | PanelError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::BAD_GATEWAY {
            tracing::error!("Request failed: {}", self.0);
        }

        let body = serde_json::json!({
            "error": self.0.code(),
            "message": self.0.to_string(),
        });
        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                axum::http::header::WWW_AUTHENTICATE,
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fp_core::NodeId;
    use std::time::Duration;

    #[test]
    fn statuses_follow_the_taxonomy() {
        let cases = [
            (PanelError::NotFound("x".into()), 404),
            (PanelError::Conflict("x".into()), 409),
            (PanelError::Unauthorized, 401),
            (PanelError::Forbidden("x".into()), 403),
            (PanelError::Unreachable("x".into()), 502),
            (PanelError::AuthFailure("x".into()), 502),
            (PanelError::timeout(Duration::from_secs(1), "x"), 504),
            (PanelError::NodeNotTunnel(NodeId::new("n")), 422),
            (PanelError::Invalid("x".into()), 400),
            (PanelError::Storage("x".into()), 500),
        ];
        for (err, code) in cases {
            assert_eq!(ApiError(err).status().as_u16(), code);
        }
    }
}
