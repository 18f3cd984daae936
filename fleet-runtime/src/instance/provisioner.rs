//! Provisioner: drives a tenant from `pending` through placement, worker
//! setup, config write, process start, DNS publish and readiness to
//! `active` (§4.6). Idempotent at every step, single-flight per tenant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::{info, warn};

use crate::config::ControlPlaneConfig;
use crate::config_store::ConfigStore;
use crate::edge::EdgeReconciler;
use crate::error::{ControlPlaneError, Result};
use crate::instance::record::{InstanceRepository, Plan};
use crate::instance::state_machine::InstanceState;
use crate::worker::{Worker, WorkerProvisioner, WorkerRegistry, WorkerTransport};

const INSTANCE_IMAGE: &str = "openclaw/instance:latest";
const DISCOVERY_NETWORK: &str = "openclaw-discovery";

/// External billing collaborator queried by the preflight step (§4.6 step 1).
/// Kept behind a trait for the same reason `WorkerProvisioner`/`DnsProvider`
/// are: it is out of this crate's scope, but the provisioner must still gate
/// on it.
#[async_trait]
pub trait PaymentAttestation: Send + Sync {
    async fn has_attestation(&self, tenant_id: &str) -> Result<bool>;
}

/// Outcome of a user-initiated `open()` call (§4.6 "open").
pub enum OpenOutcome {
    Active { url: String },
    Provisioning,
}

/// A provider credential to inject into the instance's credential store
/// (§4.6 step 7): either one of the platform's own keys, or a tenant's
/// override for that provider.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub provider: String,
    pub profile_name: String,
    pub api_key: String,
}

/// Platform-held provider keys, read directly from the environment: there
/// are few of them, they never change for the process lifetime, and they
/// are orthogonal to the rest of `ControlPlaneConfig` (§4.6 step 7 "the
/// platform's provider credentials").
fn platform_credentials() -> Vec<ProviderCredential> {
    [
        ("openai", "PLATFORM_OPENAI_API_KEY"),
        ("anthropic", "PLATFORM_ANTHROPIC_API_KEY"),
        ("openrouter", "PLATFORM_OPENROUTER_API_KEY"),
    ]
    .into_iter()
    .filter_map(|(provider, env_key)| {
        std::env::var(env_key).ok().map(|api_key| ProviderCredential {
            provider: provider.to_string(),
            profile_name: "platform".to_string(),
            api_key,
        })
    })
    .collect()
}

pub struct Provisioner {
    instances: InstanceRepository,
    workers: WorkerRegistry,
    transport: Arc<dyn WorkerTransport>,
    config_store: Arc<ConfigStore>,
    edge: Arc<EdgeReconciler>,
    worker_provisioner: Arc<dyn WorkerProvisioner>,
    billing: Arc<dyn PaymentAttestation>,
    config: &'static ControlPlaneConfig,
    platform_secret: Vec<u8>,
    /// Single-flight map (§4.6 "Single-flight"); presence of a key means a
    /// provision coroutine already owns that tenant.
    inflight: DashMap<String, ()>,
}

impl Provisioner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instances: InstanceRepository,
        workers: WorkerRegistry,
        transport: Arc<dyn WorkerTransport>,
        config_store: Arc<ConfigStore>,
        edge: Arc<EdgeReconciler>,
        worker_provisioner: Arc<dyn WorkerProvisioner>,
        billing: Arc<dyn PaymentAttestation>,
        config: &'static ControlPlaneConfig,
        platform_secret: Vec<u8>,
    ) -> Self {
        Self {
            instances,
            workers,
            transport,
            config_store,
            edge,
            worker_provisioner,
            billing,
            config,
            platform_secret,
            inflight: DashMap::new(),
        }
    }

    /// `recover(tenantId)` (§4.6): the single entry point that actually
    /// drives a provision sequence. Both the scheduler's reentry path and
    /// `LifecycleController::open`'s background branches call this —
    /// `insert_pending` makes it safe to call on a tenant with no record
    /// yet, and the terminal-state / already-active checks are the
    /// caller's responsibility (they already have the record in hand).
    pub async fn recover(
        &self,
        tenant_id: &str,
        plan: Plan,
        override_credentials: &[ProviderCredential],
    ) -> Result<OpenOutcome> {
        if self.instances.get(tenant_id).await?.is_none() {
            let ram = plan.ram_mb(self.config);
            self.instances.insert_pending(tenant_id, plan, ram).await?;
        }
        self.provision_single_flight(tenant_id, plan, override_credentials).await
    }

    async fn provision_single_flight(
        &self,
        tenant_id: &str,
        plan: Plan,
        override_credentials: &[ProviderCredential],
    ) -> Result<OpenOutcome> {
        if self.inflight.contains_key(tenant_id) {
            return Ok(OpenOutcome::Provisioning);
        }
        self.inflight.insert(tenant_id.to_string(), ());
        let result = self.run_provision(tenant_id, plan, override_credentials).await;
        self.inflight.remove(tenant_id);
        result
    }

    async fn run_provision(
        &self,
        tenant_id: &str,
        plan: Plan,
        override_credentials: &[ProviderCredential],
    ) -> Result<OpenOutcome> {
        // 1. Preflight.
        if !self.billing.has_attestation(tenant_id).await? {
            let record = self.instances.get(tenant_id).await?;
            if matches!(record.map(|r| r.state()), Some(Ok(InstanceState::Provisioning))) {
                return Err(ControlPlaneError::Conflict(format!(
                    "tenant {tenant_id} has no payment attestation"
                )));
            }
        }

        // 2. Placement.
        let record = self
            .instances
            .get(tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(tenant_id.to_string()))?;

        let worker = if record.is_placed() {
            self.workers
                .get(&record.worker_id)
                .await?
                .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?
        } else {
            self.workers
                .pick_best(
                    plan.ram_mb(self.config),
                    true,
                    self.config.overcommit_factor,
                    self.worker_provisioner.as_ref(),
                )
                .await?
        };

        let container_id = if record.container_id.is_empty() {
            format!("openclaw-{}", &crate::util::generate_gateway_token()[..12])
        } else {
            record.container_id.clone()
        };
        let subdomain = if record.subdomain.is_empty() {
            format!("t-{}", &crate::util::generate_gateway_token()[..16])
        } else {
            record.subdomain.clone()
        };

        self.instances
            .persist_placement(tenant_id, &worker.id, &container_id, &subdomain)
            .await?;
        self.workers.refresh(&worker.id).await?;

        let retries = self.instances.bump_retries(tenant_id).await?;
        if retries as u32 >= self.config.retry_ceiling {
            self.instances.set_paused(tenant_id).await?;
            self.workers.refresh(&worker.id).await?;
            self.edge.retire_hosts(&subdomain).await.ok();
            return Err(ControlPlaneError::RetryCeilingReached(tenant_id.to_string()));
        }

        let data_dir = crate::util::tenant_data_dir(tenant_id);
        let outcome = self
            .provision_steps(
                tenant_id,
                &worker,
                &container_id,
                &subdomain,
                &data_dir,
                plan,
                override_credentials,
            )
            .await;

        match outcome {
            Ok(promoted) => Ok(promoted),
            Err(err) => {
                // 14. Rollback discipline: release RAM, undo DNS, leave the
                // record in `provisioning` for the scheduler's next pass.
                warn!(tenant = tenant_id, %err, "provision step failed, rolling back");
                self.workers.refresh(&worker.id).await.ok();
                self.edge.retire_hosts(&subdomain).await.ok();
                self.instances.mark_provisioning_failed(tenant_id).await.ok();
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision_steps(
        &self,
        tenant_id: &str,
        worker: &Worker,
        container_id: &str,
        subdomain: &str,
        data_dir: &str,
        plan: Plan,
        override_credentials: &[ProviderCredential],
    ) -> Result<OpenOutcome> {
        crate::util::validate_name(container_id)?;
        crate::util::validate_name(subdomain)?;

        // 3. Worker setup: single batched remote command.
        let setup_cmd = format!(
            "docker rm -f {container} >/dev/null 2>&1; \
             docker network create {network} >/dev/null 2>&1; \
             docker network create {isolation} >/dev/null 2>&1; \
             mkdir -p {data_dir} && chmod 700 {data_dir}",
            container = crate::util::shell_escape(container_id),
            network = crate::util::shell_escape(DISCOVERY_NETWORK),
            isolation = crate::util::shell_escape(&format!("iso-{container_id}")),
            data_dir = crate::util::shell_escape(data_dir),
        );
        let output = self.transport.exec(&worker.address, &setup_cmd).await?;
        if !output.success() {
            return Err(ControlPlaneError::Transport(format!(
                "worker setup failed on {}: {}",
                worker.address, output.stderr
            )));
        }

        // 4. Edge-proxy check.
        self.edge.ensure_edge(&worker.address).await?;

        // 5. Gateway token.
        let gateway_token = crate::util::generate_gateway_token();
        self.instances.set_gateway_token(tenant_id, &gateway_token).await?;
        let initial_doc = json!({
            "gateway": {
                "auth": { "mode": "token", "token": gateway_token },
                "controlUi": { "allowInsecureAuth": false },
            }
        });
        self.config_store.write(&worker.address, data_dir, &initial_doc).await?;

        // 6. Image presence (pre-pushed at worker registration; this is the
        // idempotent fallback pull path).
        let pull_cmd = format!(
            "docker image inspect {image} >/dev/null 2>&1 || docker pull {image}",
            image = crate::util::shell_escape(INSTANCE_IMAGE)
        );
        let output = self.transport.exec(&worker.address, &pull_cmd).await?;
        if !output.success() {
            return Err(ControlPlaneError::Transport(format!(
                "image presence check failed on {}: {}",
                worker.address, output.stderr
            )));
        }

        // 7. Credential & capability injection.
        let container_secret = crate::util::container_secret(&self.platform_secret, tenant_id)?;
        let mut doc = self.config_store.read(&worker.address, data_dir).await?;
        doc["models"]["providers"]["platform"] = json!({ "routingKey": container_secret });
        doc["skills"]["entries"]["default-bundle"] = json!({ "enabled": true });
        self.config_store.write(&worker.address, data_dir, &doc).await?;

        self.write_credential_file(&worker.address, data_dir, override_credentials)
            .await?;

        let bundle_dir = format!("{data_dir}/skills/default-bundle");
        self.transport
            .exec(
                &worker.address,
                &format!("mkdir -p {}", crate::util::shell_escape(&bundle_dir)),
            )
            .await?;

        // 8. Start.
        let ram_mb = plan.ram_mb(self.config);
        let cpus = self.config.default_plan_cpus;
        let start_cmd = format!(
            "docker run -d --name {container} \
             --network {network} --network {isolation} \
             --memory {ram}m --cpus {cpus} --pids-limit 512 \
             --user nobody --cap-drop ALL \
             --label traefik.http.routers.{container}.rule=Host(`{subdomain}.{domain}`) \
             --label traefik.http.routers.{container}-preview.rule=Host(`preview-{subdomain}.{domain}`) \
             -v {data_dir}:/data {image} \
             sh -c 'openclaw gateway start & sleep 5; \
             openclaw config set gateway.controlUi.allowInsecureAuth false; \
             openclaw config set gateway.auth.mode token; \
             openclaw config set gateway.auth.token {token}; wait'",
            container = crate::util::shell_escape(container_id),
            network = crate::util::shell_escape(DISCOVERY_NETWORK),
            isolation = crate::util::shell_escape(&format!("iso-{container_id}")),
            ram = ram_mb,
            cpus = cpus,
            subdomain = subdomain,
            domain = self.config.edge_domain,
            data_dir = crate::util::shell_escape(data_dir),
            image = crate::util::shell_escape(INSTANCE_IMAGE),
            token = crate::util::shell_escape(&gateway_token),
        );
        let output = self.transport.exec(&worker.address, &start_cmd).await?;
        if !output.success() {
            return Err(ControlPlaneError::Transport(format!(
                "start failed on {}: {}",
                worker.address, output.stderr
            )));
        }

        // 9. Alive check: 1s cadence up to 10s, one restart attempt.
        if !self.poll_process_alive(&worker.address, container_id, 10).await? {
            warn!(tenant = tenant_id, "process dead after start, retrying once");
            let restart_cmd = format!(
                "docker logs --tail 50 {container}; docker start {container}",
                container = crate::util::shell_escape(container_id)
            );
            self.transport.exec(&worker.address, &restart_cmd).await?;
            if !self.poll_process_alive(&worker.address, container_id, 10).await? {
                return Err(ControlPlaneError::Transport(format!(
                    "instance process would not stay alive on {}",
                    worker.address
                )));
            }
        }

        // 10. DNS publish, ahead of readiness wait for propagation head start.
        self.edge.publish_hosts(subdomain, &worker.address).await?;

        // 11. Reapply gateway.
        self.config_store
            .reapply_gateway(&worker.address, container_id, &gateway_token)
            .await
            .ok();

        // 12. Readiness wait.
        let promoted = self
            .wait_for_readiness(tenant_id, &worker.address, container_id, subdomain)
            .await?;

        // 13. Update worker RAM accounting.
        self.workers.refresh(&worker.id).await?;

        if promoted {
            Ok(OpenOutcome::Active {
                url: format!("https://{subdomain}.{}", self.config.edge_domain),
            })
        } else {
            Ok(OpenOutcome::Provisioning)
        }
    }

    /// Write `credentials/auth-profiles.json` (mode 0600) under the tenant's
    /// data directory: the platform's own provider keys plus any tenant
    /// override, keyed `<provider>:<profileName>` (§6 "Instance credential
    /// file").
    async fn write_credential_file(
        &self,
        worker_addr: &str,
        data_dir: &str,
        override_credentials: &[ProviderCredential],
    ) -> Result<()> {
        let mut profiles = serde_json::Map::new();
        for cred in platform_credentials().iter().chain(override_credentials) {
            crate::util::validate_name(&cred.provider)?;
            crate::util::validate_name(&cred.profile_name)?;
            profiles.insert(
                format!("{}:{}", cred.provider, cred.profile_name),
                json!({ "provider": cred.provider, "mode": "api_key", "apiKey": cred.api_key }),
            );
        }
        let serialized = serde_json::to_string_pretty(&serde_json::Value::Object(profiles))?;
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &serialized);

        let credentials_dir = format!("{data_dir}/credentials");
        let path = format!("{credentials_dir}/auth-profiles.json");
        let mkdir = self
            .transport
            .exec(worker_addr, &format!("mkdir -p {}", crate::util::shell_escape(&credentials_dir)))
            .await?;
        if !mkdir.success() {
            return Err(ControlPlaneError::Transport(format!(
                "credential dir creation failed on {worker_addr}: {}",
                mkdir.stderr
            )));
        }

        let write_cmd = format!(
            "printf '%s' {} | {} && chmod 600 {}",
            crate::util::shell_escape(&encoded),
            crate::util::base64_stdin_write_command(&path),
            crate::util::shell_escape(&path),
        );
        let output = self.transport.exec(worker_addr, &write_cmd).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ControlPlaneError::Transport(format!(
                "credential file write failed on {worker_addr}: {}",
                output.stderr
            )))
        }
    }

    async fn poll_process_alive(&self, worker_addr: &str, container_id: &str, timeout_secs: u64) -> Result<bool> {
        let check_cmd = format!(
            "docker inspect -f '{{{{.State.Running}}}}' {}",
            crate::util::shell_escape(container_id)
        );
        for _ in 0..timeout_secs {
            let output = self.transport.exec(worker_addr, &check_cmd).await?;
            if output.success() && output.stdout.trim() == "true" {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(false)
    }

    /// Poll for up to 90s: process running AND an edge-proxy request with
    /// the tenant's host header returns 200/101. On success, flips the
    /// record to `active` via the same compare-and-set either this path or
    /// a later readiness probe would use (§9 "Promotion race"). On timeout,
    /// flips to `starting` instead of failing the whole provision.
    async fn wait_for_readiness(
        &self,
        tenant_id: &str,
        worker_addr: &str,
        container_id: &str,
        subdomain: &str,
    ) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(90);
        let probe_cmd = format!(
            "docker inspect -f '{{{{.State.Running}}}}' {container} && \
             curl -s -o /dev/null -w '%{{http_code}}' -H 'Host: {subdomain}.{domain}' http://localhost/",
            container = crate::util::shell_escape(container_id),
            subdomain = subdomain,
            domain = self.config.edge_domain,
        );

        while tokio::time::Instant::now() < deadline {
            let output = self.transport.exec(worker_addr, &probe_cmd).await?;
            let healthy = output.success()
                && output
                    .stdout
                    .lines()
                    .last()
                    .is_some_and(|code| code == "200" || code == "101");
            if healthy {
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
                    self.instances.touch(tenant_id).await?;
                }
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.instances
            .compare_and_set_state(
                tenant_id,
                &[InstanceState::Provisioning],
                InstanceState::Starting,
            )
            .await?;
        info!(tenant = tenant_id, "readiness wait timed out, state is starting");
        Ok(false)
    }

    /// Deprovision (§4.6 "Deprovision"): stop+remove the process, remove
    /// the tenant data directory, delete DNS names, clear placement.
    pub async fn deprovision(&self, tenant_id: &str) -> Result<()> {
        let record = self
            .instances
            .get(tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(tenant_id.to_string()))?;

        if record.is_placed() {
            let worker = self.workers.get(&record.worker_id).await?;
            if let Some(worker) = &worker {
                crate::util::validate_name(&record.container_id)?;
                let data_dir = crate::util::tenant_data_dir(tenant_id);
                let cleanup_cmd = format!(
                    "docker rm -f {container} >/dev/null 2>&1; rm -rf {data_dir}",
                    container = crate::util::shell_escape(&record.container_id),
                    data_dir = crate::util::shell_escape(&data_dir),
                );
                self.transport.exec(&worker.address, &cleanup_cmd).await?;
            }
            if !record.subdomain.is_empty() {
                self.edge.retire_hosts(&record.subdomain).await?;
            }
        }

        self.instances.clear_placement_and_cancel(tenant_id).await?;
        if !record.worker_id.is_empty() {
            self.workers.refresh(&record.worker_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn inflight_map_is_empty_constructor_invariant() {
        // Construction alone must not mark any tenant in-flight; the only
        // way into the map is through `provision_single_flight`.
        let map: DashMap<String, ()> = DashMap::new();
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn concurrent_single_flight_guard_lets_only_one_caller_through() {
        let inflight: DashMap<String, ()> = DashMap::new();
        let entered = Mutex::new(0u32);

        let try_enter = |tenant: &str| {
            if inflight.contains_key(tenant) {
                false
            } else {
                inflight.insert(tenant.to_string(), ());
                true
            }
        };

        for _ in 0..10 {
            if try_enter("tenant-x") {
                *entered.lock().unwrap() += 1;
            }
        }
        assert_eq!(*entered.lock().unwrap(), 1);
    }
}
