use axum::http::StatusCode;
use axum::Json;

#[derive(Debug, thiserror::Error)]
pub enum AegisError {
    #[error("prompt must not be empty")]
    EmptyPrompt,

    #[error("prompt exceeds maximum length")]
    PromptTooLong,

    #[error("unauthorized")]
    Unauthorized,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("store persistence error: {0}")]
    Persistence(String),

    #[error("downstream error: {0}")]
    Downstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AegisError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::EmptyPrompt | Self::PromptTooLong => StatusCode::BAD_REQUEST,
            Self::Provider(_) | Self::Downstream(_) => StatusCode::BAD_GATEWAY,
            Self::Config(_) | Self::Persistence(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl axum::response::IntoResponse for AegisError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
