//! Billing error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Why a discount code was refused for a given plan, currency and organization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountRejection {
    UnknownCode,
    Inactive,
    NotYetValid,
    Expired,
    WrongCurrency,
    WrongPlan,
    Exhausted,
    OrgCapReached,
}

impl DiscountRejection {
    /// Stable machine-readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownCode => "unknown_code",
            Self::Inactive => "inactive",
            Self::NotYetValid => "not_yet_valid",
            Self::Expired => "expired",
            Self::WrongCurrency => "wrong_currency",
            Self::WrongPlan => "wrong_plan",
            Self::Exhausted => "exhausted",
            Self::OrgCapReached => "org_cap_reached",
        }
    }
}

impl std::fmt::Display for DiscountRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            Self::UnknownCode => "Discount code not found",
            Self::Inactive => "Discount code is not active",
            Self::NotYetValid => "Discount code is not valid yet",
            Self::Expired => "Discount code has expired",
            Self::WrongCurrency => "Discount code is not valid for this currency",
            Self::WrongPlan => "Discount code is not valid for this plan",
            Self::Exhausted => "Discount code has reached its usage limit",
            Self::OrgCapReached => "Discount code already used by this organization",
        };
        f.write_str(message)
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Discount rejected: {0}")]
    DiscountRejected(DiscountRejection),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("No organization context")]
    NoOrganization,

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<DiscountRejection> for BillingError {
    fn from(rejection: DiscountRejection) -> Self {
        BillingError::DiscountRejected(rejection)
    }
}

/// True when `err` is a unique-constraint violation on the named index
pub(crate) fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.is_unique_violation() && db_err.constraint() == Some(constraint)
        }
        _ => false,
    }
}
