//! Worker registry: live RAM/slot accounting, placement selection, and
//! pool growth (§4.2).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

use crate::error::{ControlPlaneError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "worker_status", rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Draining,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Worker {
    pub id: String,
    pub address: String,
    pub status: WorkerStatus,
    pub ram_total_mb: i32,
    pub ram_used_mb: i32,
    pub last_healthy_at: chrono::DateTime<chrono::Utc>,
}

/// Placed-instance states that count toward a worker's RAM accounting
/// (§4.2 `refresh`). Sleeping instances count at full weight — freeing
/// memory is the reclaim loop's job, not the registry's.
pub const RAM_ACCOUNTED_STATES: &[&str] =
    &["provisioning", "starting", "active", "sleeping", "grace_period"];

/// External cloud-provider collaborator that provisions a new worker host.
/// Represented as a trait so `pickBest`'s grow-and-retry behavior is
/// testable without a real cloud account.
#[async_trait]
pub trait WorkerProvisioner: Send + Sync {
    async fn grow(&self) -> Result<Worker>;
}

#[derive(Clone)]
pub struct WorkerRegistry {
    pool: PgPool,
}

impl WorkerRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `pickBest(neededRamMb, allowGrow)` (§4.2).
    pub async fn pick_best(
        &self,
        needed_ram_mb: i32,
        allow_grow: bool,
        overcommit_factor: f64,
        provisioner: &dyn WorkerProvisioner,
    ) -> Result<Worker> {
        if let Some(worker) = self.best_candidate(needed_ram_mb, overcommit_factor).await? {
            return Ok(worker);
        }

        if allow_grow {
            let grown = provisioner.grow().await?;
            info!(worker = %grown.id, "grew fleet with new worker");
            self.insert(&grown).await?;
            if let Some(worker) = self.best_candidate(needed_ram_mb, overcommit_factor).await? {
                return Ok(worker);
            }
        }

        Err(ControlPlaneError::NoCapacity(format!(
            "no worker has {needed_ram_mb}MB free"
        )))
    }

    async fn best_candidate(
        &self,
        needed_ram_mb: i32,
        overcommit_factor: f64,
    ) -> Result<Option<Worker>> {
        let workers: Vec<Worker> = sqlx::query_as(
            "SELECT id, address, status, ram_total_mb, ram_used_mb, last_healthy_at \
             FROM workers WHERE status = 'active' \
             AND (ram_total_mb * $1 - ram_used_mb) >= $2 \
             ORDER BY (ram_used_mb::float8 / NULLIF(ram_total_mb, 0)) ASC, id ASC",
        )
        .bind(overcommit_factor)
        .bind(needed_ram_mb)
        .fetch_all(&self.pool)
        .await?;
        Ok(workers.into_iter().next())
    }

    /// `refresh(workerId)` — recompute `ramUsedMb` from the instances table,
    /// never by direct increment/decrement (§5).
    pub async fn refresh(&self, worker_id: &str) -> Result<i32> {
        let used: i32 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(plan_ram_mb), 0) FROM instances \
             WHERE worker_id = $1 AND state = ANY($2)",
        )
        .bind(worker_id)
        .bind(RAM_ACCOUNTED_STATES)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query("UPDATE workers SET ram_used_mb = $1 WHERE id = $2")
            .bind(used)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;

        Ok(used)
    }

    pub async fn insert(&self, worker: &Worker) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, address, status, ram_total_mb, ram_used_mb, last_healthy_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&worker.id)
        .bind(&worker.address)
        .bind(worker.status)
        .bind(worker.ram_total_mb)
        .bind(worker.ram_used_mb)
        .bind(worker.last_healthy_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, worker_id: &str) -> Result<Option<Worker>> {
        let worker = sqlx::query_as(
            "SELECT id, address, status, ram_total_mb, ram_used_mb, last_healthy_at \
             FROM workers WHERE id = $1",
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(worker)
    }

    /// Fleet-wide free RAM, used by the capacity-check tick (§4.8).
    pub async fn free_ram_mb(&self) -> Result<i64> {
        let free: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(ram_total_mb - ram_used_mb), 0) FROM workers WHERE status = 'active'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(free)
    }

    pub async fn set_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        sqlx::query("UPDATE workers SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_accounted_states_match_spec_enumeration() {
        assert_eq!(
            RAM_ACCOUNTED_STATES,
            &["provisioning", "starting", "active", "sleeping", "grace_period"]
        );
    }
}
