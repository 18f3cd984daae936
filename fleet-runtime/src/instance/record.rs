//! Durable per-tenant instance row (§3, §4.3): placement, state, subdomain,
//! container identifier, gateway auth secret, retry counter. Writes always
//! go through parameterized SQL with explicit filters; promotion races use
//! compare-and-update on `state`.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::error::{ControlPlaneError, Result};
use crate::instance::state_machine::InstanceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Starter,
    Pro,
    Business,
}

impl Plan {
    pub fn ram_mb(self, config: &crate::config::ControlPlaneConfig) -> i32 {
        match self {
            Plan::Starter => config.default_plan_ram_mb as i32 / 2,
            Plan::Pro => config.default_plan_ram_mb as i32,
            Plan::Business => config.default_plan_ram_mb as i32 * 2,
        }
    }

    pub fn max_child_agents(self) -> u32 {
        match self {
            Plan::Starter => 1,
            Plan::Pro => 4,
            Plan::Business => 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InstanceRecord {
    pub tenant_id: String,
    pub plan: String,
    pub state: String,
    pub worker_id: String,
    pub container_id: String,
    pub subdomain: String,
    pub gateway_token: String,
    pub plan_ram_mb: i32,
    pub provision_retries: i32,
    pub last_active: chrono::DateTime<chrono::Utc>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl InstanceRecord {
    pub fn state(&self) -> Result<InstanceState> {
        InstanceState::parse(&self.state)
    }

    pub fn is_placed(&self) -> bool {
        !self.worker_id.is_empty()
    }
}

#[derive(Clone)]
pub struct InstanceRepository {
    pool: PgPool,
}

impl InstanceRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tenant_id: &str) -> Result<Option<InstanceRecord>> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            "SELECT tenant_id, plan, state, worker_id, container_id, subdomain, gateway_token, \
             plan_ram_mb, provision_retries, last_active, created_at, updated_at \
             FROM instances WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn insert_pending(
        &self,
        tenant_id: &str,
        plan: Plan,
        plan_ram_mb: i32,
    ) -> Result<InstanceRecord> {
        let record = sqlx::query_as::<_, InstanceRecord>(
            "INSERT INTO instances \
             (tenant_id, plan, state, worker_id, container_id, subdomain, gateway_token, \
              plan_ram_mb, provision_retries, last_active, created_at, updated_at) \
             VALUES ($1, $2, 'pending', '', '', '', '', $3, 0, now(), now(), now()) \
             RETURNING tenant_id, plan, state, worker_id, container_id, subdomain, gateway_token, \
             plan_ram_mb, provision_retries, last_active, created_at, updated_at",
        )
        .bind(tenant_id)
        .bind(plan_name(plan))
        .bind(plan_ram_mb)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Persist placement (`workerId`, `containerId`, `subdomain` generated
    /// once) and set state `provisioning` (§4.6 step 2). `subdomain` is
    /// only written if the record doesn't already have one — it is
    /// immutable after first non-empty assignment (§3).
    pub async fn persist_placement(
        &self,
        tenant_id: &str,
        worker_id: &str,
        container_id: &str,
        subdomain: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET \
             worker_id = $2, container_id = $3, \
             subdomain = CASE WHEN subdomain = '' THEN $4 ELSE subdomain END, \
             state = 'provisioning', updated_at = now() \
             WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .bind(worker_id)
        .bind(container_id)
        .bind(subdomain)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically bump `provisionRetries` and return the new value
    /// (§4.6 step 2).
    pub async fn bump_retries(&self, tenant_id: &str) -> Result<i32> {
        let retries: i32 = sqlx::query_scalar(
            "UPDATE instances SET provision_retries = provision_retries + 1, updated_at = now() \
             WHERE tenant_id = $1 RETURNING provision_retries",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(retries)
    }

    pub async fn reset_retries(&self, tenant_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET provision_retries = 0, updated_at = now() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_gateway_token(&self, tenant_id: &str, token: &str) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET gateway_token = $2, updated_at = now() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Compare-and-update on `state`: only succeeds if the record is
    /// currently in `from`. Used for the promotion race (§9 "Promotion
    /// race") where either the provisioner's readiness wait or a later
    /// readiness probe may win, and both must use the same atomic update.
    pub async fn compare_and_set_state(
        &self,
        tenant_id: &str,
        from: &[InstanceState],
        to: InstanceState,
    ) -> Result<bool> {
        let from_strs: Vec<&str> = from.iter().map(|s| InstanceState::as_str(*s)).collect();
        let rows = sqlx::query(
            "UPDATE instances SET state = $2, updated_at = now() \
             WHERE tenant_id = $1 AND state = ANY($3)",
        )
        .bind(tenant_id)
        .bind(to.as_str())
        .bind(&from_strs)
        .execute(&self.pool)
        .await?;
        Ok(rows.rows_affected() > 0)
    }

    pub async fn touch(&self, tenant_id: &str) -> Result<()> {
        sqlx::query("UPDATE instances SET last_active = now() WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Deprovision: clear placement, set `cancelled` (§4.6 Deprovision).
    pub async fn clear_placement_and_cancel(&self, tenant_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET state = 'cancelled', worker_id = '', container_id = '', \
             updated_at = now() WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Release a RAM reservation after a failed provision (§4.6 step 14) by
    /// returning the tenant to `provisioning` with placement intact so the
    /// scheduler can retry up to the ceiling. Actual RAM bookkeeping lives
    /// in the worker registry's `refresh`.
    pub async fn mark_provisioning_failed(&self, tenant_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE instances SET state = 'provisioning', updated_at = now() \
             WHERE tenant_id = $1 AND state != 'paused' AND state != 'cancelled'",
        )
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_paused(&self, tenant_id: &str) -> Result<()> {
        sqlx::query("UPDATE instances SET state = 'paused', updated_at = now() WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Distinct worker ids with at least one placed instance, used by
    /// startup reconciliation to recompute every live worker's RAM
    /// accounting from the database of record rather than trusting
    /// whatever the process held in memory before a restart.
    pub async fn placed_worker_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT worker_id FROM instances WHERE worker_id != ''",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Every instance record with a worker placement, used by startup
    /// reconciliation to compare recorded state against each worker's live
    /// process list.
    pub async fn placed_instances(&self) -> Result<Vec<InstanceRecord>> {
        let records = sqlx::query_as::<_, InstanceRecord>(
            "SELECT tenant_id, plan, state, worker_id, container_id, subdomain, gateway_token, \
             plan_ram_mb, provision_retries, last_active, created_at, updated_at \
             FROM instances WHERE worker_id != ''",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn idle_active_tenants(
        &self,
        idle_threshold: chrono::Duration,
    ) -> Result<Vec<InstanceRecord>> {
        let cutoff = chrono::Utc::now() - idle_threshold;
        let records = sqlx::query_as::<_, InstanceRecord>(
            "SELECT tenant_id, plan, state, worker_id, container_id, subdomain, gateway_token, \
             plan_ram_mb, provision_retries, last_active, created_at, updated_at \
             FROM instances WHERE state = 'active' AND last_active < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

fn plan_name(plan: Plan) -> &'static str {
    match plan {
        Plan::Starter => "starter",
        Plan::Pro => "pro",
        Plan::Business => "business",
    }
}

pub fn parse_plan(value: &str) -> Result<Plan> {
    match value {
        "starter" => Ok(Plan::Starter),
        "pro" => Ok(Plan::Pro),
        "business" => Ok(Plan::Business),
        other => Err(ControlPlaneError::Validation(format!("unknown plan: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_ram_scales_with_tier() {
        let config = crate::config::ControlPlaneConfig {
            database_url: String::new(),
            edge_domain: String::new(),
            readiness_bind: String::new(),
            sleep_tick: std::time::Duration::from_secs(1),
            capacity_tick: std::time::Duration::from_secs(1),
            cron_tick: std::time::Duration::from_secs(1),
            idle_threshold: std::time::Duration::from_secs(1),
            retry_ceiling: 3,
            overcommit_factor: 1.0,
            capacity_threshold_mb: 4096,
            default_plan_ram_mb: 2048,
            default_plan_cpus: 1.0,
            transport_timeout: std::time::Duration::from_secs(1),
            transport_retries: 1,
        };
        assert_eq!(Plan::Starter.ram_mb(&config), 1024);
        assert_eq!(Plan::Pro.ram_mb(&config), 2048);
        assert_eq!(Plan::Business.ram_mb(&config), 4096);
    }

    #[test]
    fn parse_plan_rejects_unknown_values() {
        assert!(parse_plan("enterprise").is_err());
        assert_eq!(parse_plan("pro").unwrap(), Plan::Pro);
    }
}
