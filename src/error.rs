use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::error;

use crate::responses::RequestMeta;

pub const E_VALIDATION: &str = "VALIDATION_FAILED";
pub const E_NOT_FOUND: &str = "NOT_FOUND";
pub const E_ALREADY_ASSIGNED: &str = "QR_ALREADY_ASSIGNED";
pub const E_LIMIT_EXCEEDED: &str = "QR_LIMIT_EXCEEDED";
pub const E_INVALID_STATE: &str = "INVALID_STATE";
pub const E_NO_CODES: &str = "NO_QR_CODES_AVAILABLE";
pub const E_UPSTREAM: &str = "UPSTREAM_FAILURE";
pub const E_DB_FAILURE: &str = "DB_FAILURE";
pub const E_INTERNAL: &str = "INTERNAL";

/// Errors raised by the tag, subscription, loyalty and order operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("QR code is already assigned to another user")]
    AlreadyAssigned,

    #[error("verified QR code limit reached ({current}/{max})")]
    LimitExceeded { current: i64, max: i64 },

    #[error("{0}")]
    InvalidState(String),

    #[error("no unassigned QR codes available")]
    NoCodesAvailable,

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    BadGateway(String),
    Internal(anyhow::Error),
}

#[derive(Debug)]
pub struct ApiErrorWithMeta {
    error: ApiError,
    meta: RequestMeta,
    code: Option<String>,
    details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn with_meta(self, meta: RequestMeta) -> ApiErrorWithMeta {
        ApiErrorWithMeta {
            error: self,
            meta,
            code: None,
            details: None,
        }
    }
}

impl ApiErrorWithMeta {
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl Error {
    /// Maps a core error onto its HTTP shape and machine code.
    pub fn into_api(self, meta: RequestMeta) -> ApiErrorWithMeta {
        let message = self.to_string();
        match self {
            Error::Validation(_) => ApiError::BadRequest(message)
                .with_meta(meta)
                .with_code(E_VALIDATION),
            Error::NotFound(_) => ApiError::NotFound(message)
                .with_meta(meta)
                .with_code(E_NOT_FOUND),
            Error::AlreadyAssigned => ApiError::Conflict(message)
                .with_meta(meta)
                .with_code(E_ALREADY_ASSIGNED),
            Error::LimitExceeded { current, max } => ApiError::Conflict(message)
                .with_meta(meta)
                .with_code(E_LIMIT_EXCEEDED)
                .with_details(json!({ "current": current, "max": max })),
            Error::InvalidState(_) => ApiError::Conflict(message)
                .with_meta(meta)
                .with_code(E_INVALID_STATE),
            Error::NoCodesAvailable => ApiError::Conflict(message)
                .with_meta(meta)
                .with_code(E_NO_CODES),
            Error::Upstream(_) => ApiError::BadGateway(message)
                .with_meta(meta)
                .with_code(E_UPSTREAM),
            Error::Database(e) => ApiError::Internal(e.into())
                .with_meta(meta)
                .with_code(E_DB_FAILURE),
            Error::Internal(e) => ApiError::Internal(e)
                .with_meta(meta)
                .with_code(E_INTERNAL),
        }
    }
}

impl IntoResponse for ApiErrorWithMeta {
    fn into_response(self) -> Response {
        let (status, error_message) = match self.error {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal(e) => {
                error!("internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        let mut body = json!({
            "request_id": self.meta.request_id,
            "error": error_message,
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}
