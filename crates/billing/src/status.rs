//! Subscription lifecycle derivation
//!
//! Status is computed on every read from the stored window end timestamps.
//! The stored status column is only authoritative for the administrator-set
//! states (`suspended`, `cancelled`); everything else follows the clock:
//!
//! ```text
//! trial ──▶ active ──▶ grace_period ──▶ readonly ──▶ expired
//!        trial_ends  expires_at   grace_period_ends  readonly_period_ends
//! ```

use schoolsaas_shared::{AccessLevel, SubscriptionStatus};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::plans::Plan;

/// Window end timestamps snapshotted onto a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubscriptionWindows {
    pub trial_ends_at: Option<OffsetDateTime>,
    pub expires_at: OffsetDateTime,
    pub grace_period_ends_at: OffsetDateTime,
    pub readonly_period_ends_at: OffsetDateTime,
}

impl SubscriptionWindows {
    /// Windows for a paid activation starting at `started_at`
    pub fn for_activation(plan: &Plan, started_at: OffsetDateTime) -> Self {
        let expires_at = started_at + Duration::days(i64::from(plan.billing_period_days.max(1)));
        Self::after_expiry(plan, None, expires_at)
    }

    /// Windows for a trial starting at `started_at`; the trial ends when it expires
    pub fn for_trial(plan: &Plan, trial_days: i32, started_at: OffsetDateTime) -> Self {
        let trial_ends_at = started_at + Duration::days(i64::from(trial_days.max(0)));
        Self::after_expiry(plan, Some(trial_ends_at), trial_ends_at)
    }

    fn after_expiry(
        plan: &Plan,
        trial_ends_at: Option<OffsetDateTime>,
        expires_at: OffsetDateTime,
    ) -> Self {
        let grace_period_ends_at =
            expires_at + Duration::days(i64::from(plan.grace_period_days.max(0)));
        let readonly_period_ends_at =
            grace_period_ends_at + Duration::days(i64::from(plan.readonly_period_days.max(0)));
        Self {
            trial_ends_at,
            expires_at,
            grace_period_ends_at,
            readonly_period_ends_at,
        }
    }
}

/// Effective status at `now`. Window ends are inclusive.
pub fn derive_status(
    stored: SubscriptionStatus,
    windows: &SubscriptionWindows,
    now: OffsetDateTime,
) -> SubscriptionStatus {
    if stored.is_sticky() {
        return stored;
    }
    match windows.trial_ends_at {
        Some(trial_ends_at) if now <= trial_ends_at => SubscriptionStatus::Trial,
        _ if now <= windows.expires_at => SubscriptionStatus::Active,
        _ if now <= windows.grace_period_ends_at => SubscriptionStatus::GracePeriod,
        _ if now <= windows.readonly_period_ends_at => SubscriptionStatus::Readonly,
        _ => SubscriptionStatus::Expired,
    }
}

/// Whole days from `now` until `until`, never negative
pub fn days_until(until: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (until - now).whole_days().max(0)
}

/// Human-readable summary shown to the organization
pub fn status_message(
    status: Option<SubscriptionStatus>,
    trial_days_left: Option<i64>,
    suspension_reason: Option<&str>,
) -> String {
    match status {
        None => "No active subscription".to_string(),
        Some(SubscriptionStatus::Trial) => {
            format!("Trial period - {} days left", trial_days_left.unwrap_or(0))
        }
        Some(SubscriptionStatus::Active) => "Active subscription".to_string(),
        Some(SubscriptionStatus::GracePeriod) => {
            "Grace period - please renew to continue".to_string()
        }
        Some(SubscriptionStatus::Readonly) => {
            "Read-only mode - please renew to regain full access".to_string()
        }
        Some(SubscriptionStatus::Expired) => "Subscription expired - please renew".to_string(),
        Some(SubscriptionStatus::Suspended) => format!(
            "Account suspended: {}",
            suspension_reason.unwrap_or("Contact support")
        ),
        Some(SubscriptionStatus::Cancelled) => "Subscription cancelled".to_string(),
    }
}

/// Minimal access answer used by the request gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AccessSnapshot {
    /// `None` when the organization has no subscription
    pub status: Option<SubscriptionStatus>,
    pub access_level: AccessLevel,
    pub can_read: bool,
    pub can_write: bool,
}

impl AccessSnapshot {
    pub fn from_status(status: Option<SubscriptionStatus>) -> Self {
        let access_level = AccessLevel::for_status(status);
        Self {
            status,
            access_level,
            can_read: access_level.can_read(),
            can_write: access_level.can_write(),
        }
    }

    /// Status as reported over the API, `"none"` without a subscription
    pub fn status_label(&self) -> &'static str {
        self.status.map_or("none", |s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::tests::plan_fixture;
    use time::macros::datetime;

    fn windows() -> SubscriptionWindows {
        let plan = plan_fixture("pro", 20_000, 1_000);
        SubscriptionWindows::for_activation(&plan, datetime!(2026-01-01 00:00 UTC))
    }

    #[test]
    fn test_activation_windows() {
        let w = windows();
        assert_eq!(w.trial_ends_at, None);
        assert_eq!(w.expires_at, datetime!(2027-01-01 00:00 UTC));
        assert_eq!(w.grace_period_ends_at, datetime!(2027-01-15 00:00 UTC));
        assert_eq!(w.readonly_period_ends_at, datetime!(2027-03-16 00:00 UTC));
    }

    #[test]
    fn test_trial_windows() {
        let plan = plan_fixture("trial", 0, 0);
        let w = SubscriptionWindows::for_trial(&plan, 7, datetime!(2026-01-01 00:00 UTC));
        assert_eq!(w.trial_ends_at, Some(datetime!(2026-01-08 00:00 UTC)));
        assert_eq!(w.expires_at, datetime!(2026-01-08 00:00 UTC));
        assert_eq!(
            derive_status(
                SubscriptionStatus::Trial,
                &w,
                datetime!(2026-01-05 12:00 UTC)
            ),
            SubscriptionStatus::Trial
        );
        assert_eq!(
            derive_status(
                SubscriptionStatus::Trial,
                &w,
                datetime!(2026-01-09 00:00 UTC)
            ),
            SubscriptionStatus::GracePeriod
        );
    }

    #[test]
    fn test_window_ends_are_inclusive() {
        let w = windows();
        let stored = SubscriptionStatus::Active;
        assert_eq!(
            derive_status(stored, &w, w.expires_at),
            SubscriptionStatus::Active
        );
        assert_eq!(
            derive_status(stored, &w, w.grace_period_ends_at),
            SubscriptionStatus::GracePeriod
        );
        assert_eq!(
            derive_status(stored, &w, w.readonly_period_ends_at),
            SubscriptionStatus::Readonly
        );
        assert_eq!(
            derive_status(stored, &w, w.readonly_period_ends_at + Duration::seconds(1)),
            SubscriptionStatus::Expired
        );
    }

    #[test]
    fn test_stored_status_ignored_for_derived_states() {
        let w = windows();
        // A stale stored "expired" is recomputed from timestamps
        assert_eq!(
            derive_status(
                SubscriptionStatus::Expired,
                &w,
                datetime!(2026-06-01 00:00 UTC)
            ),
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn test_days_until() {
        let now = datetime!(2026-01-01 00:00 UTC);
        assert_eq!(days_until(datetime!(2026-01-31 12:00 UTC), now), 30);
        assert_eq!(days_until(datetime!(2025-12-01 00:00 UTC), now), 0);
    }

    #[test]
    fn test_status_messages() {
        assert_eq!(status_message(None, None, None), "No active subscription");
        assert_eq!(
            status_message(Some(SubscriptionStatus::Trial), Some(3), None),
            "Trial period - 3 days left"
        );
        assert_eq!(
            status_message(Some(SubscriptionStatus::Suspended), None, Some("Fraud review")),
            "Account suspended: Fraud review"
        );
    }

    #[test]
    fn test_access_snapshot_none() {
        let snapshot = AccessSnapshot::from_status(None);
        assert_eq!(snapshot.status_label(), "none");
        assert_eq!(snapshot.access_level, AccessLevel::None);
        assert!(!snapshot.can_read);
        assert!(!snapshot.can_write);
    }
}
