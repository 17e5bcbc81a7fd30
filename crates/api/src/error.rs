//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use schoolsaas_billing::BillingError;
use serde::Serialize;
use serde_json::json;

use crate::auth::AuthError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Stable machine-readable code
    pub code: &'static str,
    /// Human-readable message
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(code: &'static str, error: impl Into<String>) -> Self {
        Self {
            code,
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl ApiError {
    fn status_and_body(&self) -> (StatusCode, ErrorResponse) {
        match self {
            ApiError::Billing(err) => billing_error_response(err),
            ApiError::Auth(err) => err.status_and_body(),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::new("BAD_REQUEST", msg.clone()),
            ),
        }
    }
}

fn billing_error_response(err: &BillingError) -> (StatusCode, ErrorResponse) {
    match err {
        BillingError::Validation { field, message } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            ErrorResponse::new("VALIDATION_ERROR", message.clone())
                .with_details(json!({ "field": field })),
        ),
        BillingError::DiscountRejected(reason) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            ErrorResponse::new("DISCOUNT_REJECTED", reason.to_string())
                .with_details(json!({ "reason": reason.code() })),
        ),
        BillingError::Forbidden(msg) => (
            StatusCode::FORBIDDEN,
            ErrorResponse::new("FORBIDDEN", msg.clone()),
        ),
        BillingError::NoOrganization => (
            StatusCode::FORBIDDEN,
            ErrorResponse::new("NO_ORGANIZATION", "Organization context required"),
        ),
        BillingError::NotFound(msg) => (
            StatusCode::NOT_FOUND,
            ErrorResponse::new("NOT_FOUND", msg.clone()),
        ),
        BillingError::ConcurrentModification(msg) => (
            StatusCode::CONFLICT,
            ErrorResponse::new("CONFLICT", msg.clone()),
        ),
        BillingError::Database(msg) | BillingError::Internal(msg) => {
            tracing::error!(error = %msg, "Billing operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::new("INTERNAL_ERROR", "Internal server error"),
            )
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}
