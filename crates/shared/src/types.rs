//! Domain enums shared across crates

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Organization id under which platform-operator permissions are granted.
///
/// Tenant organizations never use the nil UUID, so a permission row scoped to
/// this id can only belong to a platform operator.
pub const PLATFORM_ORGANIZATION_ID: Uuid = Uuid::nil();

/// Permission names checked by the subscription engine
pub mod permissions {
    /// Read subscription status, usage and features of an organization
    pub const SUBSCRIPTION_READ: &str = "subscription.read";
    /// Submit renewal requests and payments for an organization
    pub const SUBSCRIPTION_RENEW: &str = "subscription.renew";
    /// Platform operator: confirm payments, activate/suspend, manage catalog
    pub const SUBSCRIPTION_ADMIN: &str = "subscription.admin";
}

// `YYYY-MM-DD` (de)serialization for `time::Date` fields
time::serde::format_description!(pub iso_date, Date, "[year]-[month]-[day]");

// =============================================================================
// Currency
// =============================================================================

/// Billing currency. Amounts are always integer minor units (cents).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Afn,
    Usd,
}

impl Default for Currency {
    fn default() -> Self {
        Self::Afn
    }
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Afn => "AFN",
            Self::Usd => "USD",
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AFN" => Ok(Self::Afn),
            "USD" => Ok(Self::Usd),
            _ => Err(format!("Invalid currency: {}", s)),
        }
    }
}

// =============================================================================
// Subscription status & access level
// =============================================================================

/// Stored or derived status of an organization subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    GracePeriod,
    Readonly,
    Expired,
    Suspended,
    Cancelled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::GracePeriod => "grace_period",
            Self::Readonly => "readonly",
            Self::Expired => "expired",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
        }
    }

    /// Administrator-set states that are never recomputed from timestamps
    pub fn is_sticky(&self) -> bool {
        matches!(self, Self::Suspended | Self::Cancelled)
    }

    /// Position in the time-driven lifecycle, `None` for sticky states
    pub fn lifecycle_rank(&self) -> Option<u8> {
        match self {
            Self::Trial => Some(0),
            Self::Active => Some(1),
            Self::GracePeriod => Some(2),
            Self::Readonly => Some(3),
            Self::Expired => Some(4),
            Self::Suspended | Self::Cancelled => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" => Ok(Self::Trial),
            "active" => Ok(Self::Active),
            "grace_period" => Ok(Self::GracePeriod),
            "readonly" => Ok(Self::Readonly),
            "expired" => Ok(Self::Expired),
            "suspended" => Ok(Self::Suspended),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// Coarse read/write capability derived from subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    /// Trial or active: everything allowed
    Full,
    /// Grace period: read and write, with a renewal warning
    Grace,
    /// Readonly period: reads only
    Readonly,
    /// Expired, suspended or cancelled
    Blocked,
    /// Organization has never had a subscription
    None,
}

impl AccessLevel {
    pub fn for_status(status: Option<SubscriptionStatus>) -> Self {
        match status {
            None => Self::None,
            Some(SubscriptionStatus::Trial | SubscriptionStatus::Active) => Self::Full,
            Some(SubscriptionStatus::GracePeriod) => Self::Grace,
            Some(SubscriptionStatus::Readonly) => Self::Readonly,
            Some(
                SubscriptionStatus::Expired
                | SubscriptionStatus::Suspended
                | SubscriptionStatus::Cancelled,
            ) => Self::Blocked,
        }
    }

    pub fn can_read(&self) -> bool {
        matches!(self, Self::Full | Self::Grace | Self::Readonly)
    }

    pub fn can_write(&self) -> bool {
        matches!(self, Self::Full | Self::Grace)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Grace => "grace",
            Self::Readonly => "readonly",
            Self::Blocked => "blocked",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Renewal / payment workflow
// =============================================================================

/// Renewal request status. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RenewalStatus {
    Pending,
    Approved,
    Rejected,
}

impl RenewalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for RenewalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// Manual payment record status. `Confirmed` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Rejected,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Confirmed => write!(f, "confirmed"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// How the organization paid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    Cash,
    Check,
    MobileMoney,
    Other,
}

/// Discount code pricing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DiscountType {
    /// `discount_value` is in basis points (10000 = 100%)
    Percentage,
    /// `discount_value` is an amount in cents
    Fixed,
}
