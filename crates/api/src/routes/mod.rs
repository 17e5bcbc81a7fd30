//! HTTP routes

pub mod entitlements;
pub mod platform;
pub mod subscription;

use axum::{
    middleware,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{
    auth::{require_auth, require_subscription_access, AuthState},
    state::AppState,
};

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn subscription_routes() -> Router<AppState> {
    Router::new()
        .route("/status-lite", get(subscription::status_lite))
        .route("/status", get(subscription::status))
        .route("/usage", get(subscription::usage))
        .route("/features", get(subscription::features))
        .route("/plans", get(subscription::plans))
        .route("/calculate-price", post(subscription::calculate_price))
        .route("/validate-discount", post(subscription::validate_discount))
        .route("/renewal-request", post(subscription::create_renewal_request))
        .route("/submit-payment", post(subscription::submit_payment))
        .route("/renewal-history", get(subscription::renewal_history))
        .route("/payment-history", get(subscription::payment_history))
        .route("/history", get(subscription::history))
}

fn entitlement_routes() -> Router<AppState> {
    Router::new()
        .route("/features/{key}", get(entitlements::check_feature))
        .route("/limits/{resource_key}", get(entitlements::get_limit))
        .route("/usage/check", post(entitlements::check_create))
}

fn platform_routes() -> Router<AppState> {
    Router::new()
        .route("/payments/pending", get(platform::pending_payments))
        .route("/payments/{id}/confirm", post(platform::confirm_payment))
        .route("/payments/{id}/reject", post(platform::reject_payment))
        .route("/renewals/pending", get(platform::pending_renewals))
        .route("/renewals/{id}/reject", post(platform::reject_renewal))
        .route("/subscriptions/{org_id}/trial", post(platform::start_trial))
        .route(
            "/subscriptions/{org_id}/activate",
            post(platform::activate_subscription),
        )
        .route(
            "/subscriptions/{org_id}/suspend",
            post(platform::suspend_subscription),
        )
        .route(
            "/subscriptions/{org_id}/cancel",
            post(platform::cancel_subscription),
        )
        .route("/subscriptions/{org_id}/addons", post(platform::grant_addon))
        .route(
            "/subscriptions/{org_id}/limit-overrides",
            post(platform::grant_limit_override),
        )
        .route(
            "/discount-codes",
            get(platform::list_discount_codes).post(platform::create_discount_code),
        )
        .route("/plans", get(platform::list_plans).post(platform::create_plan))
        .route(
            "/plans/{id}",
            get(platform::get_plan).put(platform::update_plan),
        )
        .route("/plans/{id}/features", put(platform::set_plan_features))
        .route("/plans/{id}/limits", put(platform::set_plan_limits))
        .route("/invariants", get(platform::run_invariant_checks))
        .route("/invariants/{check}", get(platform::run_invariant_check))
}

/// Authenticated API surface. Expects `AuthUser` in the request extensions.
///
/// Subscription and platform routes stay reachable whatever the subscription
/// state; everything else sits behind the subscription access gate.
fn api_routes(auth_state: AuthState) -> Router<AppState> {
    let gated = entitlement_routes().layer(middleware::from_fn_with_state(
        auth_state,
        require_subscription_access,
    ));

    Router::new()
        .nest("/api/v1/subscription", subscription_routes())
        .nest("/api/v1/platform", platform_routes())
        .nest("/api/v1/entitlements", gated)
}

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();
    let protected =
        api_routes(auth_state.clone()).layer(middleware::from_fn_with_state(auth_state, require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(state)
}
