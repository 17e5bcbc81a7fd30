//! Authentication and subscription access middleware for Axum

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use schoolsaas_billing::{AccessSnapshot, AuthorizationContext, BillingService};
use schoolsaas_shared::PLATFORM_ORGANIZATION_ID;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use super::jwt::JwtManager;
use crate::error::{ApiError, ErrorResponse};

/// Authenticated user extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    /// Nil for platform operators
    pub org_id: Uuid,
    pub permissions: Vec<String>,
}

impl AuthUser {
    pub fn is_platform(&self) -> bool {
        self.org_id == PLATFORM_ORGANIZATION_ID
    }

    /// Context handed to every billing call made on behalf of this user
    pub fn authorization(&self) -> AuthorizationContext {
        if self.is_platform() {
            AuthorizationContext::platform(self.user_id, self.permissions.clone())
        } else {
            AuthorizationContext::organization(
                self.org_id,
                self.user_id,
                self.permissions.clone(),
            )
        }
    }
}

/// Authentication state shared by the middleware
#[derive(Clone)]
pub struct AuthState {
    pub jwt_manager: Arc<JwtManager>,
    pub pool: PgPool,
    pub billing: Arc<BillingService>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authentication")]
    MissingAuth,
    #[error("Invalid authentication format")]
    InvalidAuthFormat,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Database error")]
    DatabaseError,
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub(crate) fn status_and_body(&self) -> (StatusCode, ErrorResponse) {
        let (status, message) = match self {
            AuthError::MissingAuth => (StatusCode::UNAUTHORIZED, "Authentication required"),
            AuthError::InvalidAuthFormat => {
                (StatusCode::UNAUTHORIZED, "Invalid authentication format")
            }
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            AuthError::DatabaseError | AuthError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        let code = if status == StatusCode::UNAUTHORIZED {
            "UNAUTHORIZED"
        } else {
            "INTERNAL_ERROR"
        };
        (status, ErrorResponse::new(code, message))
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = self.status_and_body();
        (status, Json(body)).into_response()
    }
}

/// Extract bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Result<String, AuthError> {
    let header = request
        .headers()
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingAuth)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthFormat)?;

    header
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::InvalidAuthFormat)
}

async fn authenticate(auth_state: &AuthState, token: &str) -> Result<AuthUser, AuthError> {
    let claims = auth_state.jwt_manager.validate_token(token)?;

    let permissions: Vec<String> = sqlx::query_scalar(
        "SELECT permission FROM user_permissions WHERE user_id = $1 AND organization_id = $2",
    )
    .bind(claims.sub)
    .bind(claims.org_id)
    .fetch_all(&auth_state.pool)
    .await
    .map_err(|e| {
        tracing::error!(error = %e, user_id = %claims.sub, "Failed to load permissions");
        AuthError::DatabaseError
    })?;

    Ok(AuthUser {
        user_id: claims.sub,
        org_id: claims.org_id,
        permissions,
    })
}

/// Middleware that requires a valid bearer token
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let auth_result = match extract_bearer_token(&request) {
        Ok(token) => authenticate(&auth_state, &token).await,
        Err(e) => Err(e),
    };

    match auth_result {
        Ok(auth_user) => {
            tracing::debug!(
                path = %path,
                user_id = %auth_user.user_id,
                org_id = %auth_user.org_id,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = ?err, "require_auth: authentication failed");
            err.into_response()
        }
    }
}

/// Outcome of the subscription access gate for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// No read access: no subscription, expired, suspended or cancelled
    PaymentRequired,
    /// Read-only window and the request would write
    ReadOnly,
}

/// Subscription and operator endpoints stay reachable for lapsed schools
fn is_subscription_endpoint(path: &str) -> bool {
    path.starts_with("/api/v1/subscription") || path.starts_with("/api/v1/platform")
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub fn gate_decision(path: &str, method: &Method, access: &AccessSnapshot) -> GateDecision {
    if is_subscription_endpoint(path) {
        GateDecision::Allow
    } else if !access.can_read {
        GateDecision::PaymentRequired
    } else if !access.can_write && !is_safe_method(method) {
        GateDecision::ReadOnly
    } else {
        GateDecision::Allow
    }
}

fn gate_response(decision: GateDecision, access: &AccessSnapshot) -> Response {
    let (status, code, message) = match decision {
        GateDecision::PaymentRequired => (
            StatusCode::PAYMENT_REQUIRED,
            "PAYMENT_REQUIRED",
            "Subscription inactive. Renew your subscription to restore access.",
        ),
        GateDecision::ReadOnly => (
            StatusCode::FORBIDDEN,
            "READ_ONLY",
            "Subscription is read-only. Renew your subscription to make changes.",
        ),
        GateDecision::Allow => return StatusCode::OK.into_response(),
    };

    let body = ErrorResponse::new(code, message).with_details(json!({
        "status": access.status_label(),
        "access_level": access.access_level,
        "renewal_url": "/api/v1/subscription/renewal-request",
    }));
    (status, Json(body)).into_response()
}

/// Middleware that blocks organization traffic the subscription no longer covers.
/// Must run after `require_auth`.
pub async fn require_subscription_access(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>().cloned() else {
        return next.run(request).await;
    };
    if auth_user.is_platform() || is_subscription_endpoint(request.uri().path()) {
        return next.run(request).await;
    }

    let access = match auth_state.billing.entitlements.access(auth_user.org_id).await {
        Ok(access) => access,
        Err(e) => return ApiError::from(e).into_response(),
    };

    match gate_decision(request.uri().path(), request.method(), &access) {
        GateDecision::Allow => next.run(request).await,
        decision => {
            tracing::info!(
                org_id = %auth_user.org_id,
                path = %request.uri().path(),
                status = access.status_label(),
                decision = ?decision,
                "Request blocked by subscription gate"
            );
            gate_response(decision, &access)
        }
    }
}
