#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared types and database plumbing for the school SaaS platform.
//!
//! Everything here is consumed by both the API server and the worker:
//! domain enums persisted as `VARCHAR` columns, permission names, the
//! reserved platform organization id and connection pool helpers.

pub mod db;
pub mod types;

pub use db::{create_pool, run_migrations, DbConfig};
pub use types::{
    iso_date, permissions, AccessLevel, Currency, DiscountType, PaymentMethod, PaymentStatus,
    RenewalStatus, SubscriptionStatus, PLATFORM_ORGANIZATION_ID,
};
