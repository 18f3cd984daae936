//! Process-wide configuration loaded once from the environment.
//!
//! Mirrors the load-once-and-cache pattern used throughout this codebase:
//! a typed loader gated behind a `OnceCell`, defaults for everything that
//! has a sane one, hard failure at startup for anything load-bearing.

use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::{ControlPlaneError, Result};

static CONFIG: OnceCell<ControlPlaneConfig> = OnceCell::new();

#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Postgres connection string for the instance/worker tables.
    pub database_url: String,
    /// Domain suffix the edge proxy routes under, e.g. `agents.example.com`.
    pub edge_domain: String,
    /// Bind address for the ambient readiness/health HTTP surface.
    pub readiness_bind: String,

    /// Sleep-reclaim tick interval (default 5 min).
    pub sleep_tick: Duration,
    /// Capacity-check tick interval (default 10 min).
    pub capacity_tick: Duration,
    /// Scheduled-tasks tick interval (default 1 min).
    pub cron_tick: Duration,
    /// Idle duration after which an active tenant is eligible for sleep.
    pub idle_threshold: Duration,
    /// Provision attempts before a tenant is frozen in `paused`.
    pub retry_ceiling: u32,
    /// Fleet-wide RAM overcommit factor applied in `pickBest`.
    pub overcommit_factor: f64,
    /// Fleet-wide free-RAM floor that triggers a capacity-check grow
    /// (default 4GB).
    pub capacity_threshold_mb: i64,
    /// Default plan sizing for tenants with no explicit plan override.
    pub default_plan_ram_mb: u32,
    pub default_plan_cpus: f64,

    /// Worker transport connect timeout and retry budget (§4.1).
    pub transport_timeout: Duration,
    pub transport_retries: u32,
}

impl ControlPlaneConfig {
    pub fn load() -> &'static ControlPlaneConfig {
        CONFIG.get_or_init(|| Self::from_env().expect("invalid control-plane configuration"))
    }

    fn from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| {
            ControlPlaneError::Configuration("DATABASE_URL is required".to_string())
        })?;
        let edge_domain = std::env::var("EDGE_DOMAIN").map_err(|_| {
            ControlPlaneError::Configuration("EDGE_DOMAIN is required".to_string())
        })?;

        Ok(Self {
            database_url,
            edge_domain,
            readiness_bind: env_string("READINESS_BIND", "0.0.0.0:9090"),
            sleep_tick: env_secs("SLEEP_TICK", 300),
            capacity_tick: env_secs("CAPACITY_TICK", 600),
            cron_tick: env_secs("CRON_TICK", 60),
            idle_threshold: env_secs("IDLE_THRESHOLD", 30 * 60),
            retry_ceiling: env_parse("RETRY_CEILING", 3),
            overcommit_factor: env_parse("OVERCOMMIT_FACTOR", 1.0),
            capacity_threshold_mb: env_parse("CAPACITY_THRESHOLD_MB", 4096),
            default_plan_ram_mb: env_parse("DEFAULT_PLAN_RAM", 2048),
            default_plan_cpus: env_parse("DEFAULT_PLAN_CPUS", 1.0),
            transport_timeout: env_secs("WORKER_TRANSPORT_TIMEOUT", 30),
            transport_retries: env_parse("WORKER_TRANSPORT_RETRIES", 3),
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_on_missing_or_bad_value() {
        assert_eq!(env_parse::<u32>("FLEET_RUNTIME_TEST_UNSET_KEY", 3), 3);
        // SAFETY: test-only, single-threaded access to an isolated key.
        unsafe {
            std::env::set_var("FLEET_RUNTIME_TEST_BAD_KEY", "not-a-number");
        }
        assert_eq!(env_parse::<u32>("FLEET_RUNTIME_TEST_BAD_KEY", 7), 7);
        unsafe {
            std::env::remove_var("FLEET_RUNTIME_TEST_BAD_KEY");
        }
    }

    #[test]
    fn env_secs_converts_to_duration() {
        assert_eq!(
            env_secs("FLEET_RUNTIME_TEST_UNSET_SECS", 42),
            Duration::from_secs(42)
        );
    }
}
