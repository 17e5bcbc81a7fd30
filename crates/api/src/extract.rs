//! Request extractors that reject with the JSON error envelope
//!
//! axum's own `Json`/`Query` rejections answer in plain text. These wrappers
//! route the rejection through [`ApiError`] so a malformed field comes back
//! as a 422 naming the field.

use axum::extract::{
    rejection::{JsonRejection, QueryRejection},
    FromRequest, FromRequestParts,
};
use schoolsaas_billing::BillingError;

use crate::error::ApiError;

/// `axum::Json` with [`ApiError`] rejections
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct AppJson<T>(pub T);

/// `axum::extract::Query` with [`ApiError`] rejections
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(ApiError))]
pub struct AppQuery<T>(pub T);

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        match rejection {
            JsonRejection::JsonDataError(err) => {
                let message = err.body_text();
                let field = rejected_field(&message).unwrap_or_else(|| "body".to_string());
                ApiError::Billing(BillingError::validation(field, message))
            }
            other => ApiError::BadRequest(other.body_text()),
        }
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        let message = rejection.body_text();
        let field = rejected_field(&message).unwrap_or_else(|| "query".to_string());
        ApiError::Billing(BillingError::validation(field, message))
    }
}

/// Field named by a serde error message, either as a `path: ...` prefix or
/// as ``missing field `name` ``
fn rejected_field(message: &str) -> Option<String> {
    let detail = ["target type: ", "query string: "]
        .iter()
        .find_map(|prefix| message.split_once(prefix).map(|(_, rest)| rest))
        .unwrap_or(message);

    if let Some((path, _)) = detail.split_once(": ") {
        if !path.is_empty() && path != "." && !path.contains(' ') {
            return Some(path.to_string());
        }
    }

    detail
        .split_once("missing field `")
        .and_then(|(_, rest)| rest.split_once('`'))
        .map(|(field, _)| field.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header::CONTENT_TYPE, Method, Request, StatusCode},
        routing::{get, post},
        Router,
    };
    use serde::Deserialize;
    use serde_json::Value;
    use tower::ServiceExt;

    #[derive(Debug, Deserialize)]
    struct Payment {
        amount_cents: i64,
    }

    fn app() -> Router {
        Router::new()
            .route(
                "/payments",
                post(|AppJson(payment): AppJson<Payment>| async move {
                    payment.amount_cents.to_string()
                }),
            )
            .route(
                "/usage",
                get(|AppQuery(payment): AppQuery<Payment>| async move {
                    payment.amount_cents.to_string()
                }),
            )
    }

    async fn send(request: Request<Body>) -> (StatusCode, Value) {
        let response = app().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn post_json(body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/payments")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_wrong_type_names_the_field() {
        let (status, body) = send(post_json(r#"{"amount_cents":"abc"}"#)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "VALIDATION_ERROR");
        assert_eq!(body["details"]["field"], "amount_cents");
    }

    #[tokio::test]
    async fn test_missing_field_names_the_field() {
        let (status, body) = send(post_json("{}")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["details"]["field"], "amount_cents");
    }

    #[tokio::test]
    async fn test_broken_json_is_bad_request() {
        let (status, body) = send(post_json(r#"{"amount_cents":"#)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_missing_query_value_names_the_field() {
        let (status, body) = send(Request::get("/usage").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["details"]["field"], "amount_cents");
    }

    #[tokio::test]
    async fn test_bad_query_value_uses_envelope() {
        let (status, body) = send(
            Request::get("/usage?amount_cents=lots")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_valid_body_passes_through() {
        let response = app()
            .oneshot(post_json(r#"{"amount_cents":22000}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_rejected_field_parsing() {
        assert_eq!(
            rejected_field(
                "Failed to deserialize the JSON body into the target type: \
                 payment_date: input contains invalid characters at line 1 column 30"
            )
            .as_deref(),
            Some("payment_date")
        );
        assert_eq!(
            rejected_field("missing field `currency` at line 1 column 2").as_deref(),
            Some("currency")
        );
        assert_eq!(
            rejected_field("invalid type: map, expected a string at line 1 column 0"),
            None
        );
    }
}
