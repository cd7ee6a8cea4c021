//! JSON error responses.

use crate::error::ServiceError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

/// Wire shape of every error: `{"error": "..."}` plus optional hints.
#[derive(ToSchema, Serialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Unix seconds at which a cooldown ends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    status: StatusCode,
    message: String,
    code: Option<&'static str>,
    locked_until: Option<i64>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code: None,
            locked_until: None,
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    pub fn too_many(message: impl Into<String>) -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, message)
    }

    /// 429 carrying the lock expiry.
    pub fn locked(until: DateTime<Utc>) -> Self {
        Self {
            locked_until: Some(until.timestamp()),
            ..Self::too_many("too many attempts")
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Maps a collaborator error, replacing a not-found message with `not_found`.
    pub fn or_not_found(err: ServiceError, not_found: &str) -> Self {
        match err {
            ServiceError::NotFound => Self::not_found(not_found),
            other => other.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Forbidden
            | ServiceError::ResizeDisabled
            | ServiceError::RealNameRequired => StatusCode::FORBIDDEN,
            ServiceError::Conflict
            | ServiceError::InsufficientBalance
            | ServiceError::ResizeInProgress => StatusCode::CONFLICT,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ServiceError::Internal(detail) => {
                error!("Collaborator failure: {detail}");
                return Self::internal("internal error");
            }
            ServiceError::InvalidInput
            | ServiceError::NotSupported
            | ServiceError::NoPaymentRequired
            | ServiceError::Transport(_)
            | ServiceError::Rejected(_) => StatusCode::BAD_REQUEST,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
            code: self.code.map(str::to_string),
            locked_until: self.locked_until,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use axum::body::to_bytes;
    use serde_json::Value;

    #[test]
    fn sentinel_statuses() {
        let cases = [
            (ServiceError::Forbidden, StatusCode::FORBIDDEN),
            (ServiceError::Conflict, StatusCode::CONFLICT),
            (ServiceError::InsufficientBalance, StatusCode::CONFLICT),
            (ServiceError::ResizeInProgress, StatusCode::CONFLICT),
            (ServiceError::NotFound, StatusCode::NOT_FOUND),
            (ServiceError::RealNameRequired, StatusCode::FORBIDDEN),
            (ServiceError::InvalidInput, StatusCode::BAD_REQUEST),
            (ServiceError::NoPaymentRequired, StatusCode::BAD_REQUEST),
            (ServiceError::transport("smtp disabled"), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn internal_detail_is_hidden() {
        let err = ApiError::from(ServiceError::internal("db exploded"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "internal error");
    }

    #[tokio::test]
    async fn body_includes_hints() -> Result<()> {
        let response = ApiError::forbidden("2fa required")
            .with_code("admin_2fa_required")
            .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = to_bytes(response.into_body(), usize::MAX).await?;
        let json: Value = serde_json::from_slice(&body)?;
        assert_eq!(json["error"], "2fa required");
        assert_eq!(json["code"], "admin_2fa_required");
        assert!(json.get("locked_until").is_none());
        Ok(())
    }
}
