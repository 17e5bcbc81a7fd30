//! Application state

use std::sync::Arc;

use schoolsaas_billing::BillingService;
use sqlx::PgPool;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: Arc<JwtManager>,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = Arc::new(JwtManager::new(
            &config.jwt_secret,
            config.jwt_expiry_hours,
        ));
        let billing = Arc::new(BillingService::new(pool.clone(), config.billing_config()));

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
            pool: self.pool.clone(),
            billing: self.billing.clone(),
        }
    }
}
