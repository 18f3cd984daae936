//! Lifecycle controller: wake/sleep/restart/touch and the `open()` UX
//! composition (§4.7). Sleep/wake mutual exclusion is enforced per tenant
//! by `sleepLocks`, the second of the two single-flight devices named in
//! §9 ("inflight" being the first, owned by the provisioner).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::info;

use crate::config::ControlPlaneConfig;
use crate::config_store::ConfigStore;
use crate::error::{ControlPlaneError, Result};
use crate::instance::provisioner::{Provisioner, ProviderCredential};
use crate::instance::record::{InstanceRepository, Plan};
use crate::instance::state_machine::InstanceState;
use crate::worker::{WorkerRegistry, WorkerTransport};

const REAPPLY_DELAY: Duration = Duration::from_secs(10);

pub struct LifecycleController {
    instances: InstanceRepository,
    workers: WorkerRegistry,
    transport: Arc<dyn WorkerTransport>,
    config_store: Arc<ConfigStore>,
    provisioner: Arc<Provisioner>,
    config: &'static ControlPlaneConfig,
    sleep_locks: DashMap<String, ()>,
}

impl LifecycleController {
    pub fn new(
        instances: InstanceRepository,
        workers: WorkerRegistry,
        transport: Arc<dyn WorkerTransport>,
        config_store: Arc<ConfigStore>,
        provisioner: Arc<Provisioner>,
        config: &'static ControlPlaneConfig,
    ) -> Self {
        Self {
            instances,
            workers,
            transport,
            config_store,
            provisioner,
            config,
            sleep_locks: DashMap::new(),
        }
    }

    fn instance_url(&self, subdomain: &str) -> String {
        format!("https://{subdomain}.{}", self.config.edge_domain)
    }

    /// `wake(tenantId)` (§4.7).
    pub async fn wake(&self, tenant_id: &str) -> Result<()> {
        if self.sleep_locks.contains_key(tenant_id) {
            return Err(ControlPlaneError::Conflict(format!(
                "sleep/wake already in flight for {tenant_id}"
            )));
        }
        self.sleep_locks.insert(tenant_id.to_string(), ());
        let result = self.wake_inner(tenant_id).await;
        self.sleep_locks.remove(tenant_id);
        result
    }

    async fn wake_inner(&self, tenant_id: &str) -> Result<()> {
        let record = self
            .instances
            .get(tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(tenant_id.to_string()))?;
        let worker = self
            .workers
            .get(&record.worker_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?;
        crate::util::validate_name(&record.container_id)?;

        let start_cmd = format!(
            "docker start {}",
            crate::util::shell_escape(&record.container_id)
        );
        let output = self.transport.exec(&worker.address, &start_cmd).await?;
        if !output.success() {
            return Err(ControlPlaneError::Transport(format!(
                "wake failed to start container on {}: {}",
                worker.address, output.stderr
            )));
        }
        tokio::time::sleep(Duration::from_secs(2)).await;

        self.instances
            .compare_and_set_state(
                tenant_id,
                &[InstanceState::Sleeping, InstanceState::GracePeriod],
                InstanceState::Active,
            )
            .await?;
        self.instances.touch(tenant_id).await?;

        self.schedule_reapply(tenant_id, &worker.address, &record.container_id, &record.gateway_token);
        Ok(())
    }

    /// `sleep(tenantId)` (§4.7). Memory accounting is the reclaim loop's
    /// job via `refresh`, not this method's.
    pub async fn sleep(&self, tenant_id: &str) -> Result<()> {
        if self.sleep_locks.contains_key(tenant_id) {
            return Err(ControlPlaneError::Conflict(format!(
                "sleep/wake already in flight for {tenant_id}"
            )));
        }
        self.sleep_locks.insert(tenant_id.to_string(), ());
        let result = self.sleep_inner(tenant_id).await;
        self.sleep_locks.remove(tenant_id);
        result
    }

    async fn sleep_inner(&self, tenant_id: &str) -> Result<()> {
        let record = self
            .instances
            .get(tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(tenant_id.to_string()))?;
        let worker = self
            .workers
            .get(&record.worker_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?;
        crate::util::validate_name(&record.container_id)?;

        let stop_cmd = format!(
            "docker stop {}",
            crate::util::shell_escape(&record.container_id)
        );
        let output = self.transport.exec(&worker.address, &stop_cmd).await?;
        if !output.success() {
            return Err(ControlPlaneError::Transport(format!(
                "sleep failed to stop container on {}: {}",
                worker.address, output.stderr
            )));
        }

        self.instances
            .compare_and_set_state(tenant_id, &[InstanceState::Active], InstanceState::Sleeping)
            .await?;
        Ok(())
    }

    /// `restart(tenantId)` (§4.7). Clears stale per-session lock files
    /// before restarting so the instance's own startup doesn't inherit a
    /// lock from a previous, crashed run.
    pub async fn restart(&self, tenant_id: &str) -> Result<()> {
        let record = self
            .instances
            .get(tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(tenant_id.to_string()))?;
        let worker = self
            .workers
            .get(&record.worker_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?;
        crate::util::validate_name(&record.container_id)?;

        let data_dir = crate::util::tenant_data_dir(tenant_id);
        let clear_locks_cmd = format!("rm -f {}/*.lock", crate::util::shell_escape(&data_dir));
        self.transport.exec(&worker.address, &clear_locks_cmd).await.ok();

        let restart_cmd = format!(
            "docker restart {}",
            crate::util::shell_escape(&record.container_id)
        );
        let output = self.transport.exec(&worker.address, &restart_cmd).await?;
        if !output.success() {
            return Err(ControlPlaneError::Transport(format!(
                "restart failed on {}: {}",
                worker.address, output.stderr
            )));
        }

        self.schedule_reapply(tenant_id, &worker.address, &record.container_id, &record.gateway_token);
        Ok(())
    }

    /// `touch(tenantId)` (§4.7).
    pub async fn touch(&self, tenant_id: &str) -> Result<()> {
        self.instances.touch(tenant_id).await
    }

    /// `open(tenantId)`, the user's click-through (§4.7 "open"). Composes
    /// the provisioner and the state probes above into the five observable
    /// branches the spec enumerates.
    pub async fn open(
        &self,
        tenant_id: &str,
        plan: Plan,
        override_credentials: Vec<ProviderCredential>,
    ) -> Result<String> {
        let record = self.instances.get(tenant_id).await?;

        let Some(record) = record else {
            // No placement at all: start a fresh provision in the
            // background, single-flight, and report "poll later".
            let provisioner = self.provisioner.clone();
            let tenant_id = tenant_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = provisioner.recover(&tenant_id, plan, &override_credentials).await {
                    info!(tenant = %tenant_id, %err, "background provision failed");
                }
            });
            return Err(ControlPlaneError::NotProvisioned(
                "provisioning, poll later".to_string(),
            ));
        };

        let state = record.state()?;
        match state {
            InstanceState::Sleeping => {
                self.wake(tenant_id).await?;
                Ok(self.instance_url(&record.subdomain))
            }
            InstanceState::Provisioning | InstanceState::Starting => {
                let worker = self.workers.get(&record.worker_id).await?;
                let running = match &worker {
                    Some(worker) => self.process_is_running(&worker.address, &record.container_id).await?,
                    None => false,
                };
                if running {
                    let promoted = self
                        .instances
                        .compare_and_set_state(
                            tenant_id,
                            &[InstanceState::Provisioning, InstanceState::Starting],
                            InstanceState::Active,
                        )
                        .await?;
                    if promoted {
                        self.instances.reset_retries(tenant_id).await?;
                    }
                    Ok(self.instance_url(&record.subdomain))
                } else {
                    let provisioner = self.provisioner.clone();
                    let tenant_id_owned = tenant_id.to_string();
                    let override_credentials = override_credentials.clone();
                    tokio::spawn(async move {
                        if let Err(err) = provisioner.recover(&tenant_id_owned, plan, &override_credentials).await {
                            info!(tenant = %tenant_id_owned, %err, "background re-provision failed");
                        }
                    });
                    Err(ControlPlaneError::NotProvisioned("provisioning".to_string()))
                }
            }
            InstanceState::Active => {
                let worker = self
                    .workers
                    .get(&record.worker_id)
                    .await?
                    .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?;
                if self.process_is_running(&worker.address, &record.container_id).await? {
                    self.instances.touch(tenant_id).await?;
                    Ok(self.instance_url(&record.subdomain))
                } else {
                    let start_cmd = format!(
                        "docker start {}",
                        crate::util::shell_escape(&record.container_id)
                    );
                    let output = self.transport.exec(&worker.address, &start_cmd).await?;
                    if output.success() {
                        self.instances.touch(tenant_id).await?;
                        Ok(self.instance_url(&record.subdomain))
                    } else {
                        let provisioner = self.provisioner.clone();
                        let tenant_id_owned = tenant_id.to_string();
                        let override_credentials = override_credentials.clone();
                        tokio::spawn(async move {
                            if let Err(err) = provisioner.recover(&tenant_id_owned, plan, &override_credentials).await {
                                info!(tenant = %tenant_id_owned, %err, "background re-provision failed");
                            }
                        });
                        Err(ControlPlaneError::NotProvisioned("provisioning".to_string()))
                    }
                }
            }
            InstanceState::Pending | InstanceState::GracePeriod | InstanceState::Paused | InstanceState::Cancelled => {
                Err(ControlPlaneError::Conflict(format!(
                    "tenant {tenant_id} is {}",
                    state.as_str()
                )))
            }
        }
    }

    async fn process_is_running(&self, worker_addr: &str, container_id: &str) -> Result<bool> {
        crate::util::validate_name(container_id)?;
        let cmd = format!(
            "docker inspect -f '{{{{.State.Running}}}}' {}",
            crate::util::shell_escape(container_id)
        );
        let output = self.transport.exec(worker_addr, &cmd).await?;
        Ok(output.success() && output.stdout.trim() == "true")
    }

    fn schedule_reapply(&self, tenant_id: &str, worker_addr: &str, container_id: &str, gateway_token: &str) {
        let config_store = self.config_store.clone();
        let worker_addr = worker_addr.to_string();
        let container_id = container_id.to_string();
        let gateway_token = gateway_token.to_string();
        let tenant_id = tenant_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(REAPPLY_DELAY).await;
            if let Err(err) = config_store
                .reapply_gateway(&worker_addr, &container_id, &gateway_token)
                .await
            {
                info!(tenant = %tenant_id, %err, "delayed reapplyGateway failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reapply_delay_matches_spec_window() {
        assert_eq!(REAPPLY_DELAY, Duration::from_secs(10));
    }
}
