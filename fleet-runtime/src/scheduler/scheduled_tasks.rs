//! Scheduled-tasks tick (§4.8): every `cronTick` (default 1 min), run the
//! cron-driven tasks that are due, deliver their payload via
//! `sendMessage`, and record success/failure. Never wakes a sleeping
//! tenant unless the task is marked `wakeRequired` — waking on every tick
//! would defeat the sleep-reclaim loop's whole purpose.
//!
//! Next-run computation is grounded on the teacher's `compute_next_run`:
//! same `cron::Schedule::from_str(...).after(&base).next()` shape, reused
//! here instead of the teacher's own in-process workflow trigger.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use cron::Schedule;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::config_store::ConfigStore;
use crate::error::{ControlPlaneError, Result};
use crate::instance::{InstanceRepository, InstanceState, LifecycleController};
use crate::worker::WorkerRegistry;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ScheduledTask {
    pub id: String,
    pub tenant_id: String,
    pub cron_expr: String,
    pub payload: String,
    pub wake_required: bool,
    pub active: bool,
    pub next_run_at: chrono::DateTime<Utc>,
    pub last_run_at: Option<chrono::DateTime<Utc>>,
}

pub struct ScheduledTaskRepository {
    pool: PgPool,
}

impl ScheduledTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn due_tasks(&self, now: chrono::DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let tasks = sqlx::query_as::<_, ScheduledTask>(
            "SELECT id, tenant_id, cron_expr, payload, wake_required, active, next_run_at, last_run_at \
             FROM scheduled_tasks WHERE active AND next_run_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    pub async fn record_run(
        &self,
        task_id: &str,
        ran_at: chrono::DateTime<Utc>,
        next_run_at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scheduled_tasks SET last_run_at = $2, next_run_at = $3 WHERE id = $1",
        )
        .bind(task_id)
        .bind(ran_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Success/failure accounting for a scheduled run. A dollar-cost figure
/// would need the gateway to report token usage back through
/// `sendMessage`'s one-shot stdin injection, which it doesn't — this
/// records outcomes only; cost attribution stays with external billing.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    async fn record(&self, tenant_id: &str, task_id: &str, success: bool) -> Result<()>;
}

pub struct ScheduledTasksLoop {
    instances: InstanceRepository,
    workers: WorkerRegistry,
    config_store: Arc<ConfigStore>,
    lifecycle: Arc<LifecycleController>,
    tasks: ScheduledTaskRepository,
    usage: Arc<dyn UsageLedger>,
}

impl ScheduledTasksLoop {
    pub fn new(
        instances: InstanceRepository,
        workers: WorkerRegistry,
        config_store: Arc<ConfigStore>,
        lifecycle: Arc<LifecycleController>,
        tasks: ScheduledTaskRepository,
        usage: Arc<dyn UsageLedger>,
    ) -> Self {
        Self {
            instances,
            workers,
            config_store,
            lifecycle,
            tasks,
            usage,
        }
    }

    pub async fn tick(&self) -> usize {
        let now = Utc::now();
        let due = match self.tasks.due_tasks(now).await {
            Ok(tasks) => tasks,
            Err(err) => {
                warn!(%err, "scheduled-tasks: failed to list due tasks");
                return 0;
            }
        };

        let mut ran = 0;
        for task in due {
            let outcome = self.run_task(&task, now).await;
            let success = outcome.is_ok();
            if let Err(err) = &outcome {
                warn!(task = %task.id, tenant = %task.tenant_id, %err, "scheduled-tasks: run failed");
            } else {
                ran += 1;
            }
            self.usage.record(&task.tenant_id, &task.id, success).await.ok();

            let next_run_at = match compute_next_run(&task.cron_expr, now) {
                Ok(next) => next,
                Err(err) => {
                    warn!(task = %task.id, %err, "scheduled-tasks: bad cron expression, deferring an hour");
                    now + chrono::Duration::hours(1)
                }
            };
            self.tasks.record_run(&task.id, now, next_run_at).await.ok();
        }
        ran
    }

    async fn run_task(&self, task: &ScheduledTask, now: chrono::DateTime<Utc>) -> Result<()> {
        let record = self
            .instances
            .get(&task.tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(task.tenant_id.clone()))?;
        let state = record.state()?;

        if state == InstanceState::Sleeping {
            if !task.wake_required {
                info!(task = %task.id, tenant = %task.tenant_id, "scheduled-tasks: skipping, tenant asleep");
                return Ok(());
            }
            self.lifecycle.wake(&task.tenant_id).await?;
        } else if state != InstanceState::Active {
            return Err(ControlPlaneError::Conflict(format!(
                "tenant {} is {} at scheduled run {now}",
                task.tenant_id,
                state.as_str()
            )));
        }

        let worker = self
            .workers
            .get(&record.worker_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?;
        self.config_store
            .send_message(&worker.address, &record.container_id, &task.payload)
            .await
    }
}

fn compute_next_run(cron_expr: &str, from: chrono::DateTime<Utc>) -> std::result::Result<chrono::DateTime<Utc>, String> {
    let schedule = Schedule::from_str(cron_expr).map_err(|err| format!("invalid cron expression: {err}"))?;
    schedule
        .after(&from)
        .next()
        .ok_or_else(|| "cron expression has no future run times".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_next_run_advances_past_the_given_instant() {
        let from = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let next = compute_next_run("0 */5 * * * *", from).unwrap();
        assert!(next > from);
    }

    #[test]
    fn compute_next_run_rejects_malformed_expressions() {
        let from = Utc::now();
        assert!(compute_next_run("not a cron expression", from).is_err());
    }
}
