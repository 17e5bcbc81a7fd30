//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Authorization context construction (organization vs platform)
//! - Subscription gate decisions per access level and method
//! - Auth error responses

#[cfg(test)]
mod tests {
    use super::super::middleware::*;
    use axum::http::{Method, StatusCode};
    use schoolsaas_billing::{AccessSnapshot, BillingError};
    use schoolsaas_shared::{permissions, SubscriptionStatus, PLATFORM_ORGANIZATION_ID};
    use uuid::Uuid;

    fn snapshot(status: Option<SubscriptionStatus>) -> AccessSnapshot {
        AccessSnapshot::from_status(status)
    }

    #[test]
    fn test_org_user_gets_organization_context() {
        let org_id = Uuid::new_v4();
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            org_id,
            permissions: vec![permissions::SUBSCRIPTION_READ.to_string()],
        };

        let ctx = user.authorization();
        assert!(!user.is_platform());
        assert_eq!(
            ctx.require_org_permission(permissions::SUBSCRIPTION_READ).unwrap(),
            org_id
        );
        assert!(matches!(
            ctx.require_platform_admin(),
            Err(BillingError::Forbidden(_))
        ));
    }

    #[test]
    fn test_platform_user_gets_platform_context() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            org_id: PLATFORM_ORGANIZATION_ID,
            permissions: vec![permissions::SUBSCRIPTION_ADMIN.to_string()],
        };

        let ctx = user.authorization();
        assert!(user.is_platform());
        assert!(ctx.require_platform_admin().is_ok());
        assert!(ctx.require_org_id().is_err());
    }

    #[test]
    fn test_admin_permission_in_school_org_is_not_platform_admin() {
        let user = AuthUser {
            user_id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            permissions: vec![permissions::SUBSCRIPTION_ADMIN.to_string()],
        };
        assert!(user.authorization().require_platform_admin().is_err());
    }

    #[test]
    fn test_gate_allows_active_writes() {
        let access = snapshot(Some(SubscriptionStatus::Active));
        assert_eq!(
            gate_decision("/api/v1/students", &Method::POST, &access),
            GateDecision::Allow
        );
    }

    #[test]
    fn test_gate_grace_period_still_writes() {
        let access = snapshot(Some(SubscriptionStatus::GracePeriod));
        assert_eq!(
            gate_decision("/api/v1/students", &Method::PUT, &access),
            GateDecision::Allow
        );
    }

    #[test]
    fn test_gate_readonly_blocks_writes_only() {
        let access = snapshot(Some(SubscriptionStatus::Readonly));
        assert_eq!(
            gate_decision("/api/v1/students", &Method::GET, &access),
            GateDecision::Allow
        );
        assert_eq!(
            gate_decision("/api/v1/students", &Method::DELETE, &access),
            GateDecision::ReadOnly
        );
    }

    #[test]
    fn test_gate_blocks_expired_and_unsubscribed() {
        for status in [
            None,
            Some(SubscriptionStatus::Expired),
            Some(SubscriptionStatus::Suspended),
            Some(SubscriptionStatus::Cancelled),
        ] {
            assert_eq!(
                gate_decision("/api/v1/students", &Method::GET, &snapshot(status)),
                GateDecision::PaymentRequired,
                "status {:?}",
                status
            );
        }
    }

    #[test]
    fn test_gate_exempts_subscription_endpoints() {
        let access = snapshot(Some(SubscriptionStatus::Expired));
        assert_eq!(
            gate_decision("/api/v1/subscription/renewal-request", &Method::POST, &access),
            GateDecision::Allow
        );
        assert_eq!(
            gate_decision("/api/v1/subscription/status", &Method::GET, &access),
            GateDecision::Allow
        );
    }

    #[test]
    fn test_auth_errors_are_unauthorized() {
        for err in [
            AuthError::MissingAuth,
            AuthError::InvalidAuthFormat,
            AuthError::InvalidToken,
        ] {
            assert_eq!(err.status_and_body().0, StatusCode::UNAUTHORIZED);
        }
        assert_eq!(
            AuthError::DatabaseError.status_and_body().0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
