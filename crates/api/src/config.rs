//! Environment-driven server configuration

use std::time::Duration;

use schoolsaas_billing::BillingConfig;

/// HS256 secrets shorter than this are refused at startup
pub const MIN_JWT_SECRET_LENGTH: usize = 32;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:3000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("JWT_SECRET must be at least 32 bytes")]
    WeakJwtSecret,
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub entitlement_cache_ttl: Duration,
    pub usage_warning_threshold: i32,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let jwt_secret = lookup("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LENGTH {
            return Err(ConfigError::WeakJwtSecret);
        }

        let allowed_origins = lookup("ALLOWED_ORIGINS")
            .unwrap_or_else(|| DEFAULT_ALLOWED_ORIGIN.to_string())
            .split(',')
            .map(|origin| origin.trim().to_string())
            .filter(|origin| !origin.is_empty())
            .collect();

        Ok(Self {
            database_url,
            bind_address: lookup("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            jwt_secret,
            jwt_expiry_hours: parse_or(&lookup, "JWT_EXPIRY_HOURS", 24)?,
            entitlement_cache_ttl: Duration::from_secs(parse_or(
                &lookup,
                "ENTITLEMENT_CACHE_TTL_SECS",
                30,
            )?),
            usage_warning_threshold: parse_or(&lookup, "USAGE_WARNING_THRESHOLD", 80)?,
            allowed_origins,
            run_migrations: parse_or(&lookup, "RUN_MIGRATIONS", false)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 10)?,
        })
    }

    pub fn billing_config(&self) -> BillingConfig {
        BillingConfig {
            entitlement_cache_ttl: self.entitlement_cache_ttl,
            usage_warning_threshold: self.usage_warning_threshold,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
    }
}
