use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use fireflies_llm::LlmError;

/// Why an orchestration run stopped without finishing normally.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("client disconnected")]
    Disconnected,
}

/// Failure answered with a JSON `{error, details?}` body.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Ollama API key not configured")]
    MissingApiKey,
    #[error("{message}")]
    Upstream {
        status: u16,
        message: String,
        details: Option<String>,
    },
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Map a gateway failure, keeping the upstream status.
    pub fn from_llm(err: &LlmError, model: &str) -> Self {
        match err {
            LlmError::MissingApiKey => Self::MissingApiKey,
            other => Self::Upstream {
                status: other.status_code(),
                message: other.user_message(model),
                details: other.details().map(str::to_string),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MissingApiKey | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Upstream {
                details: Some(details),
                ..
            } => json!({"error": self.to_string(), "details": details}),
            _ => json!({"error": self.to_string()}),
        };
        (status, Json(body)).into_response()
    }
}
