//! Concrete adapters for the four external collaborators this crate treats
//! as out-of-scope interfaces (§1): billing attestation, fleet growth, DNS,
//! and the edge proxy's own health/recreate controls. Each is a thin HTTP
//! or shell wrapper, grounded on the teacher's `util::http_client`
//! OnceCell pattern and `http::send_json` JSON round-trip — the actual
//! billing/cloud/DNS systems are someone else's service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use reqwest::Client;
use serde_json::json;
use tracing::warn;

use crate::error::{ControlPlaneError, Result};
use crate::instance::PaymentAttestation;
use crate::worker::{Worker, WorkerProvisioner, WorkerStatus, WorkerTransport};

static HTTP_CLIENT: OnceCell<Client> = OnceCell::new();

fn http_client() -> Result<&'static Client> {
    HTTP_CLIENT
        .get_or_try_init(|| {
            Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(|err| ControlPlaneError::Transport(format!("failed to build HTTP client: {err}")))
        })
}

/// Queries the billing service's attestation endpoint. `base_url` is the
/// billing service root; absence of `BILLING_API_URL` at construction time
/// means every tenant is treated as attested, for local/dev runs.
pub struct HttpPaymentAttestation {
    base_url: Option<String>,
}

impl HttpPaymentAttestation {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("BILLING_API_URL").ok(),
        }
    }
}

#[async_trait]
impl PaymentAttestation for HttpPaymentAttestation {
    async fn has_attestation(&self, tenant_id: &str) -> Result<bool> {
        let Some(base_url) = &self.base_url else {
            return Ok(true);
        };
        let url = format!("{base_url}/tenants/{tenant_id}/attestation");
        let response = http_client()?
            .get(&url)
            .send()
            .await
            .map_err(|err| ControlPlaneError::Transport(format!("billing check failed: {err}")))?;
        Ok(response.status().is_success())
    }
}

/// Calls a cloud-provisioning webhook to add a worker host to the fleet.
pub struct HttpWorkerProvisioner {
    webhook_url: String,
}

impl HttpWorkerProvisioner {
    pub fn from_env() -> Result<Self> {
        let webhook_url = std::env::var("WORKER_PROVISIONER_URL").map_err(|_| {
            ControlPlaneError::Configuration("WORKER_PROVISIONER_URL is required".to_string())
        })?;
        Ok(Self { webhook_url })
    }
}

#[async_trait]
impl WorkerProvisioner for HttpWorkerProvisioner {
    async fn grow(&self) -> Result<Worker> {
        let response = http_client()?
            .post(&self.webhook_url)
            .send()
            .await
            .map_err(|err| ControlPlaneError::Transport(format!("worker grow request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(ControlPlaneError::NoCapacity(format!(
                "worker provisioner returned {}",
                response.status()
            )));
        }
        #[derive(serde::Deserialize)]
        struct GrowResponse {
            id: String,
            address: String,
            ram_total_mb: i32,
        }
        let body: GrowResponse = response
            .json()
            .await
            .map_err(|err| ControlPlaneError::Transport(format!("malformed grow response: {err}")))?;
        Ok(Worker {
            id: body.id,
            address: body.address,
            status: WorkerStatus::Active,
            ram_total_mb: body.ram_total_mb,
            ram_used_mb: 0,
            last_healthy_at: chrono::Utc::now(),
        })
    }
}

/// Upserts/deletes A-records through a generic token-authenticated DNS
/// provider API (`DNS_API_URL`/`DNS_API_TOKEN`).
pub struct HttpDnsProvider {
    base_url: String,
    token: String,
    domain: String,
}

impl HttpDnsProvider {
    pub fn from_env(domain: String) -> Result<Self> {
        let base_url = std::env::var("DNS_API_URL")
            .map_err(|_| ControlPlaneError::Configuration("DNS_API_URL is required".to_string()))?;
        let token = std::env::var("DNS_API_TOKEN")
            .map_err(|_| ControlPlaneError::Configuration("DNS_API_TOKEN is required".to_string()))?;
        Ok(Self { base_url, token, domain })
    }
}

#[async_trait]
impl crate::edge::DnsProvider for HttpDnsProvider {
    async fn upsert_a_record(&self, host: &str, target_addr: &str) -> Result<()> {
        let url = format!("{}/records/{host}.{}", self.base_url, self.domain);
        let response = http_client()?
            .put(&url)
            .bearer_auth(&self.token)
            .json(&json!({"type": "A", "value": target_addr}))
            .send()
            .await
            .map_err(|err| ControlPlaneError::Transport(format!("DNS upsert failed: {err}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ControlPlaneError::Transport(format!(
                "DNS upsert for {host} returned {}",
                response.status()
            )))
        }
    }

    async fn delete_a_record(&self, host: &str) -> Result<()> {
        let url = format!("{}/records/{host}.{}", self.base_url, self.domain);
        let response = http_client()?
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| ControlPlaneError::Transport(format!("DNS delete failed: {err}")))?;
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ControlPlaneError::Transport(format!(
                "DNS delete for {host} returned {}",
                response.status()
            )))
        }
    }
}

/// Drives the edge proxy's health and recreate over the same worker shell
/// channel used for container commands (§6 "runs on every worker").
pub struct ShellEdgeProxy {
    transport: Arc<dyn WorkerTransport>,
    discovery_network: &'static str,
}

impl ShellEdgeProxy {
    pub fn new(transport: Arc<dyn WorkerTransport>, discovery_network: &'static str) -> Self {
        Self {
            transport,
            discovery_network,
        }
    }
}

#[async_trait]
impl crate::edge::EdgeProxy for ShellEdgeProxy {
    async fn is_healthy(&self, worker_addr: &str) -> Result<bool> {
        let cmd = "docker inspect -f '{{.State.Running}}:{{json .NetworkSettings.Networks}}' edge-proxy 2>/dev/null || echo false";
        let output = self.transport.exec(worker_addr, cmd).await?;
        let Some((running, networks)) = output.stdout.trim().split_once(':') else {
            return Ok(false);
        };
        Ok(running == "true" && networks.contains(&format!("\"{}\"", self.discovery_network)))
    }

    async fn recreate(&self, worker_addr: &str) -> Result<bool> {
        let cmd = format!(
            "docker rm -f edge-proxy >/dev/null 2>&1; \
             docker run -d --name edge-proxy --restart unless-stopped \
             --network {network} -p 80:80 -p 443:443 \
             -v /var/run/docker.sock:/var/run/docker.sock:ro \
             traefik:v3.0 --providers.docker --providers.docker.network={network}",
            network = self.discovery_network,
        );
        let output = self.transport.exec(worker_addr, &cmd).await?;
        if output.success() {
            Ok(true)
        } else {
            warn!(worker = worker_addr, stderr = %output.stderr, "edge proxy recreate failed");
            Err(ControlPlaneError::Transport(format!(
                "edge proxy recreate failed on {worker_addr}: {}",
                output.stderr
            )))
        }
    }
}
