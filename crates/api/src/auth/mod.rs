//! Authentication module for the School SaaS API

pub mod jwt;
pub mod middleware;
#[cfg(test)]
mod middleware_tests;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    gate_decision, require_auth, require_subscription_access, AuthError, AuthState, AuthUser,
    GateDecision,
};
