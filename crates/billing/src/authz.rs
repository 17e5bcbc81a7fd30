//! Per-request authorization context
//!
//! Every service call that needs a permission takes an explicit
//! [`AuthorizationContext`]. Organization-scoped contexts carry the caller's
//! permissions within one tenant; platform contexts are scoped to
//! [`PLATFORM_ORGANIZATION_ID`] and are the only way to reach operator
//! operations.

use std::collections::HashSet;

use schoolsaas_shared::{permissions, PLATFORM_ORGANIZATION_ID};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone)]
pub struct AuthorizationContext {
    pub organization_id: Option<Uuid>,
    pub user_id: Uuid,
    pub permissions: HashSet<String>,
}

impl AuthorizationContext {
    /// Context for a user acting inside a tenant organization
    pub fn organization(
        organization_id: Uuid,
        user_id: Uuid,
        permissions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            organization_id: Some(organization_id),
            user_id,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Context for a platform operator
    pub fn platform(user_id: Uuid, permissions: impl IntoIterator<Item = String>) -> Self {
        Self {
            organization_id: Some(PLATFORM_ORGANIZATION_ID),
            user_id,
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_platform(&self) -> bool {
        self.organization_id == Some(PLATFORM_ORGANIZATION_ID)
    }

    /// Tenant organization id, rejecting platform contexts
    pub fn require_org_id(&self) -> BillingResult<Uuid> {
        match self.organization_id {
            Some(id) if id != PLATFORM_ORGANIZATION_ID => Ok(id),
            _ => Err(BillingError::NoOrganization),
        }
    }

    /// Tenant organization id, provided the caller holds `permission` there
    pub fn require_org_permission(&self, permission: &str) -> BillingResult<Uuid> {
        let org_id = self.require_org_id()?;
        if !self.has_permission(permission) {
            return Err(BillingError::Forbidden(format!(
                "Missing permission: {}",
                permission
            )));
        }
        Ok(org_id)
    }

    /// Operator gate: platform scope plus `subscription.admin`
    pub fn require_platform_admin(&self) -> BillingResult<()> {
        if !self.is_platform() || !self.has_permission(permissions::SUBSCRIPTION_ADMIN) {
            tracing::warn!(
                user_id = %self.user_id,
                "Operator operation attempted without platform admin permission"
            );
            return Err(BillingError::Forbidden(
                "Platform subscription administration required".to_string(),
            ));
        }
        Ok(())
    }
}
