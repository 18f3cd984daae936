//! Edge proxy + DNS reconciliation (§4.5). Both collaborators are external
//! to this crate; they are represented as traits, the way the teacher
//! represents its pluggable confidential-compute backends behind a single
//! factory/trait boundary, so reconciliation logic is testable against
//! in-memory fakes.

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;

/// Per-worker HTTP/WS router keyed by host header.
#[async_trait]
pub trait EdgeProxy: Send + Sync {
    /// Whether the edge proxy process is present and correctly wired to
    /// the worker-local process-supervisor's discovery API.
    async fn is_healthy(&self, worker_addr: &str) -> Result<bool>;

    /// Tear down and recreate the proxy with the current discovery
    /// setting. Returns whether a recreate actually happened.
    async fn recreate(&self, worker_addr: &str) -> Result<bool>;
}

/// Authoritative DNS provider for the tenant domain.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    async fn upsert_a_record(&self, host: &str, target_addr: &str) -> Result<()>;
    async fn delete_a_record(&self, host: &str) -> Result<()>;
}

pub struct EdgeReconciler {
    proxy: Box<dyn EdgeProxy>,
    dns: Box<dyn DnsProvider>,
}

impl EdgeReconciler {
    pub fn new(proxy: Box<dyn EdgeProxy>, dns: Box<dyn DnsProvider>) -> Self {
        Self { proxy, dns }
    }

    /// `ensureEdge(worker)` (§4.5). Stateless between calls — always treats
    /// the live worker as truth.
    pub async fn ensure_edge(&self, worker_addr: &str) -> Result<bool> {
        if self.proxy.is_healthy(worker_addr).await? {
            return Ok(false);
        }
        info!(worker = worker_addr, "edge proxy misconfigured, recreating");
        self.proxy.recreate(worker_addr).await
    }

    /// `publishHosts(subdomain, workerAddr)` (§4.5). Upserts `<subdomain>`
    /// and `preview-<subdomain>`; deletion (used by deprovision) is
    /// idempotent.
    pub async fn publish_hosts(&self, subdomain: &str, worker_addr: &str) -> Result<()> {
        crate::util::validate_name(subdomain)?;
        self.dns.upsert_a_record(subdomain, worker_addr).await?;
        self.dns
            .upsert_a_record(&format!("preview-{subdomain}"), worker_addr)
            .await?;
        Ok(())
    }

    pub async fn retire_hosts(&self, subdomain: &str) -> Result<()> {
        crate::util::validate_name(subdomain)?;
        self.dns.delete_a_record(subdomain).await?;
        self.dns
            .delete_a_record(&format!("preview-{subdomain}"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeProxy {
        healthy: Mutex<bool>,
        recreated: Mutex<u32>,
    }

    #[async_trait]
    impl EdgeProxy for FakeProxy {
        async fn is_healthy(&self, _worker_addr: &str) -> Result<bool> {
            Ok(*self.healthy.lock().unwrap())
        }

        async fn recreate(&self, _worker_addr: &str) -> Result<bool> {
            *self.healthy.lock().unwrap() = true;
            *self.recreated.lock().unwrap() += 1;
            Ok(true)
        }
    }

    #[derive(Clone, Default)]
    struct FakeDns {
        records: std::sync::Arc<Mutex<std::collections::HashMap<String, String>>>,
    }

    #[async_trait]
    impl DnsProvider for FakeDns {
        async fn upsert_a_record(&self, host: &str, target_addr: &str) -> Result<()> {
            self.records
                .lock()
                .unwrap()
                .insert(host.to_string(), target_addr.to_string());
            Ok(())
        }

        async fn delete_a_record(&self, host: &str) -> Result<()> {
            self.records.lock().unwrap().remove(host);
            Ok(())
        }
    }

    #[tokio::test]
    async fn ensure_edge_recreates_only_when_unhealthy() {
        let proxy = FakeProxy {
            healthy: Mutex::new(false),
            recreated: Mutex::new(0),
        };
        let dns = FakeDns::default();
        let reconciler = EdgeReconciler::new(Box::new(proxy), Box::new(dns));

        let recreated = reconciler.ensure_edge("worker-1").await.unwrap();
        assert!(recreated);
        let recreated_again = reconciler.ensure_edge("worker-1").await.unwrap();
        assert!(!recreated_again);
    }

    #[tokio::test]
    async fn publish_hosts_upserts_both_subdomain_and_preview() {
        let proxy = FakeProxy {
            healthy: Mutex::new(true),
            recreated: Mutex::new(0),
        };
        let dns = FakeDns::default();
        let records_handle = dns.records.clone();
        let reconciler = EdgeReconciler::new(Box::new(proxy), Box::new(dns));

        reconciler.publish_hosts("tenant-a", "10.0.0.5").await.unwrap();
        let records = records_handle.lock().unwrap();
        assert_eq!(records.get("tenant-a"), Some(&"10.0.0.5".to_string()));
        assert_eq!(records.get("preview-tenant-a"), Some(&"10.0.0.5".to_string()));
    }
}
