use serde_json::json;

/// Error type shared by the request path.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Upstream error: status={status}, message={message}")]
    Upstream { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category for status code selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    InvalidRequest,
    UpstreamFailure,
    ServerError,
}

impl GatewayError {
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            GatewayError::InvalidRequest(_) => ErrorCategory::InvalidRequest,
            GatewayError::Upstream { .. } | GatewayError::Transport(_) => {
                ErrorCategory::UpstreamFailure
            }
            GatewayError::Config(_) | GatewayError::Internal(_) => ErrorCategory::ServerError,
        }
    }

    /// Client-facing message for the `details` field.
    ///
    /// Invalid requests carry their message verbatim so the caller can act
    /// on it; everything else is rendered through `Display`.
    #[must_use]
    pub fn details(&self) -> String {
        match self {
            GatewayError::InvalidRequest(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

fn http_status_for_category(cat: ErrorCategory) -> http::StatusCode {
    match cat {
        ErrorCategory::InvalidRequest => http::StatusCode::BAD_REQUEST,
        ErrorCategory::UpstreamFailure => http::StatusCode::BAD_GATEWAY,
        ErrorCategory::ServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn summary_for_category(cat: ErrorCategory) -> &'static str {
    match cat {
        ErrorCategory::InvalidRequest => "Invalid request format.",
        ErrorCategory::UpstreamFailure | ErrorCategory::ServerError => {
            "An error occurred while processing your request."
        }
    }
}

/// Format an error as `(status, {"error": ..., "details": ...})`.
#[must_use]
pub fn format_error(err: &GatewayError) -> (http::StatusCode, serde_json::Value) {
    let cat = err.category();
    let body = match err {
        // The request validator already produced a complete sentence.
        GatewayError::InvalidRequest(message) => json!({ "error": message }),
        _ => json!({
            "error": summary_for_category(cat),
            "details": err.details(),
        }),
    };
    (http_status_for_category(cat), body)
}

impl axum::response::IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = format_error(&self);
        (status, axum::Json(body)).into_response()
    }
}
