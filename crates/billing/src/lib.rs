// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError::Validation carries owned field/message strings
#![allow(clippy::too_many_arguments)] // Transaction helpers thread tx, org, plan and actor through
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! School SaaS Billing Engine
//!
//! Subscription entitlement and billing lifecycle for school organizations.
//!
//! ## Features
//!
//! - **Plan Catalog**: Plans with per-currency pricing, features and resource limits
//! - **Entitlement Gate**: Cached feature and usage-limit checks per organization
//! - **Subscription Lifecycle**: Trial, active, grace, read-only and expired
//!   windows derived on every read; operator suspension and cancellation
//! - **Pricing**: Per-school pricing with validated discount codes
//! - **Renewals**: Organizations request a plan and report offline payments
//! - **Reconciliation**: Operators confirm payments, atomically activating the
//!   requested plan and consuming the discount code
//! - **History**: Append-only audit trail of every subscription change
//! - **Invariants**: Read-only consistency checks

pub mod authz;
pub mod discount;
pub mod entitlement;
pub mod error;
pub mod history;
pub mod invariants;
pub mod payments;
pub mod plans;
pub mod pricing;
pub mod renewal;
pub mod status;
pub mod subscriptions;


// Authorization
pub use authz::AuthorizationContext;

// Discounts
pub use discount::{CounterResult, DiscountCode, DiscountContext, DiscountService, NewDiscountCode};

// Entitlement
pub use entitlement::{
    canonical_feature_key, AddonGrant, EntitlementCache, EntitlementService, FeatureAddon,
    LimitOverride, LimitOverrideGrant, OrgEntitlement, UsageCheck, DEFAULT_CACHE_TTL,
};

// Error
pub use error::{BillingError, BillingResult, DiscountRejection};

// History
pub use history::{HistoryAction, HistoryService, SubscriptionHistoryEntry};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Payments
pub use payments::{ConfirmOutcome, PaymentRecord, PaymentService, SubmitOutcome, SubmitPayment};

// Plans
pub use plans::{
    LimitValue, NewPlan, Plan, PlanCatalog, PlanDetails, PlanLimit, PlanLimitInput, PlanUpdate,
};

// Pricing
pub use pricing::{PriceCalculator, PriceQuote, PriceRequest};

// Renewals
pub use renewal::{CreateRenewalRequest, CreatedRenewal, RenewalRequest, RenewalService};

// Status
pub use status::{AccessSnapshot, SubscriptionWindows};

// Subscriptions
pub use subscriptions::{
    ActivationParams, ExpiryReminder, OrganizationSubscription, SubscriptionService,
    SubscriptionStatusView,
};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

/// Tunables shared by the billing services
#[derive(Debug, Clone, Copy)]
pub struct BillingConfig {
    /// How long an organization's entitlement stays cached; zero disables caching
    pub entitlement_cache_ttl: Duration,
    /// Usage warning threshold (percent) for limits without their own
    pub usage_warning_threshold: i32,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            entitlement_cache_ttl: DEFAULT_CACHE_TTL,
            usage_warning_threshold: plans::DEFAULT_WARNING_THRESHOLD,
        }
    }
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub plans: PlanCatalog,
    pub discounts: DiscountService,
    pub pricing: PriceCalculator,
    pub subscriptions: SubscriptionService,
    pub renewals: RenewalService,
    pub payments: PaymentService,
    pub entitlements: EntitlementService,
    pub history: HistoryService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    pub fn new(pool: PgPool, config: BillingConfig) -> Self {
        let cache = Arc::new(EntitlementCache::new(config.entitlement_cache_ttl));
        let plans = PlanCatalog::new(pool.clone(), cache.clone());
        let discounts = DiscountService::new(pool.clone());
        let pricing = PriceCalculator::new(plans.clone(), discounts.clone());

        Self {
            subscriptions: SubscriptionService::new(pool.clone(), plans.clone(), cache.clone()),
            renewals: RenewalService::new(pool.clone(), pricing.clone()),
            payments: PaymentService::new(pool.clone(), cache.clone()),
            entitlements: EntitlementService::new(pool.clone(), cache)
                .with_default_warning_threshold(config.usage_warning_threshold),
            history: HistoryService::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
            plans,
            discounts,
            pricing,
        }
    }
}
