use std::time::Duration;

use anyhow::{anyhow, Context};

use crate::conflict::ConflictPolicy;

pub const DEFAULT_ML_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// When absent, scoring runs on the local heuristics only.
    pub ml_service_url: Option<String>,
    pub ml_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
    pub max_connections: u32,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup, so tests need not touch
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .context("DATABASE_URL must be set to a Postgres instance")?;

        let ml_service_url = lookup("ML_SERVICE_URL")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let ml_timeout_secs = match lookup("ML_TIMEOUT_SECS") {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .with_context(|| format!("ML_TIMEOUT_SECS must be a whole number, got '{raw}'"))?,
            None => DEFAULT_ML_TIMEOUT_SECS,
        };
        if ml_timeout_secs == 0 {
            return Err(anyhow!("ML_TIMEOUT_SECS must be at least 1"));
        }

        let conflict_policy = match lookup("CONFLICT_POLICY") {
            Some(raw) => raw.parse::<ConflictPolicy>()?,
            None => ConflictPolicy::default(),
        };

        let max_connections = match lookup("DB_MAX_CONNECTIONS") {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("DB_MAX_CONNECTIONS must be a whole number, got '{raw}'"))?,
            None => DEFAULT_MAX_CONNECTIONS,
        };

        Ok(AppConfig {
            database_url,
            ml_service_url,
            ml_timeout: Duration::from_secs(ml_timeout_secs),
            conflict_policy,
            max_connections,
        })
    }
}
