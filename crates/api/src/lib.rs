// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError by value
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! School SaaS API Library
//!
//! HTTP surface of the subscription engine: bearer authentication, the
//! subscription access gate, organization-scoped subscription routes and
//! platform operator routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod extract;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
