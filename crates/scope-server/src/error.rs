use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use scope_core::ScopeError;
use serde_json::json;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// A scoping failure inside an HTTP handler, answered with a 500.
///
/// Handlers returning `Result<_, ScopeRejection>` can use `?` on provider
/// lookups.
#[derive(Debug)]
pub struct ScopeRejection(pub ScopeError);

impl From<ScopeError> for ScopeRejection {
    fn from(error: ScopeError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ScopeRejection {
    fn into_response(self) -> Response {
        error!("scoping failure while handling request: {}", self.0);
        let body = Json(json!({
            "error": "scope",
            "message": self.0.to_string(),
        }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}
