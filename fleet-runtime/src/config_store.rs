//! Per-tenant JSON config document kept on the worker's filesystem, with
//! atomic write, backup fallback on corruption, and the "reapply gateway"
//! protocol that survives the instance's own self-healing pass (§4.4).

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::warn;

use crate::error::{ControlPlaneError, Result};
use crate::worker::WorkerTransport;

/// A write shorter than this is refused outright (§3 "Document never
/// serialized empty").
const MIN_DOCUMENT_BYTES: usize = 10;

/// Whether `err` reflects the worker being unreachable rather than the
/// document on disk being absent or corrupt — the two must never be
/// treated alike by `read`'s fallback chain (§4.10).
fn is_connectivity_failure(err: &ControlPlaneError) -> bool {
    matches!(err, ControlPlaneError::Unreachable(_) | ControlPlaneError::Transport(_))
}

pub struct ConfigStore {
    transport: Arc<dyn WorkerTransport>,
}

impl ConfigStore {
    pub fn new(transport: Arc<dyn WorkerTransport>) -> Self {
        Self { transport }
    }

    fn primary_path(data_dir: &str) -> String {
        format!("{data_dir}/openclaw.json")
    }

    fn backup_path(data_dir: &str) -> String {
        format!("{data_dir}/openclaw.default.json")
    }

    /// `read(worker, tenantId)` (§4.4). Falls through primary -> backup ->
    /// empty object with a warning; callers must never persist the empty
    /// fallback (the write-side guard refuses it anyway). A connectivity
    /// failure (`Unreachable`/`Transport`) is never treated as "parse
    /// failed, use backup" — it propagates and fails the whole step,
    /// since it says nothing about whether the document on disk is good.
    pub async fn read(&self, worker_addr: &str, data_dir: &str) -> Result<Value> {
        let primary = Self::primary_path(data_dir);
        match self.read_and_parse(worker_addr, &primary).await {
            Ok(doc) => return Ok(doc),
            Err(err) if is_connectivity_failure(&err) => return Err(err),
            Err(_) => {}
        }

        let backup = Self::backup_path(data_dir);
        match self.read_and_parse(worker_addr, &backup).await {
            Ok(doc) => {
                warn!(worker = worker_addr, data_dir, "config primary corrupt, used backup");
                return Ok(doc);
            }
            Err(err) if is_connectivity_failure(&err) => return Err(err),
            Err(_) => {}
        }

        warn!(worker = worker_addr, data_dir, "config primary and backup both unreadable");
        Ok(json!({}))
    }

    async fn read_and_parse(&self, worker_addr: &str, path: &str) -> Result<Value> {
        let output = self
            .transport
            .exec(worker_addr, &format!("cat {}", crate::util::shell_escape(path)))
            .await?;
        if !output.success() {
            return Err(ControlPlaneError::Validation(format!("cannot read {path}")));
        }
        serde_json::from_str(&output.stdout).map_err(ControlPlaneError::from)
    }

    /// `write(worker, tenantId, doc)` (§4.4). Serializes, refuses an
    /// under-length body, writes to `*.tmp` then atomically renames.
    pub async fn write(&self, worker_addr: &str, data_dir: &str, doc: &Value) -> Result<()> {
        let serialized = serde_json::to_string_pretty(doc)?;
        if serialized.len() < MIN_DOCUMENT_BYTES {
            return Err(ControlPlaneError::InvariantViolation(
                "refusing to write near-empty config document".to_string(),
            ));
        }

        let primary = Self::primary_path(data_dir);
        let tmp = format!("{primary}.tmp");
        let payload = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &serialized);

        let write_tmp_cmd = format!(
            "printf '%s' {} | {}",
            crate::util::shell_escape(&payload),
            crate::util::base64_stdin_write_command(&tmp)
        );
        let output = self.transport.exec(worker_addr, &write_tmp_cmd).await;
        let output = match output {
            Ok(out) if out.success() => {
                let rename_cmd = format!(
                    "mv {} {}",
                    crate::util::shell_escape(&tmp),
                    crate::util::shell_escape(&primary)
                );
                self.transport.exec(worker_addr, &rename_cmd).await
            }
            other => other,
        };

        match output {
            Ok(out) if out.success() => {
                let backup = Self::backup_path(data_dir);
                let _ = self
                    .transport
                    .exec(worker_addr, &format!("cp {} {}", crate::util::shell_escape(&primary), crate::util::shell_escape(&backup)))
                    .await;
                Ok(())
            }
            Ok(out) => {
                let _ = self
                    .transport
                    .exec(worker_addr, &format!("rm -f {}", crate::util::shell_escape(&tmp)))
                    .await;
                Err(ControlPlaneError::Transport(format!(
                    "config write failed on {worker_addr}: {}",
                    out.stderr
                )))
            }
            Err(err) => {
                let _ = self
                    .transport
                    .exec(worker_addr, &format!("rm -f {}", crate::util::shell_escape(&tmp)))
                    .await;
                Err(err)
            }
        }
    }

    /// Re-issue the gateway's mandatory runtime settings through the
    /// instance's own config-set interface after its startup "doctor" pass
    /// has stripped them (§4.4 `reapplyGateway`). Idempotent: two
    /// back-to-back calls are indistinguishable in effect from one (§8).
    pub async fn reapply_gateway(
        &self,
        worker_addr: &str,
        container_id: &str,
        gateway_token: &str,
    ) -> Result<()> {
        crate::util::validate_name(container_id)?;
        let set_auth = format!(
            "docker exec {} openclaw config set gateway.controlUi.allowInsecureAuth false",
            crate::util::shell_escape(container_id)
        );
        let set_mode = format!(
            "docker exec {} openclaw config set gateway.auth.mode token",
            crate::util::shell_escape(container_id)
        );
        let approve_token = format!(
            "docker exec {} openclaw config set gateway.auth.token {}",
            crate::util::shell_escape(container_id),
            crate::util::shell_escape(gateway_token)
        );

        for cmd in [set_auth, set_mode, approve_token] {
            let output = self.transport.exec(worker_addr, &cmd).await?;
            if !output.success() {
                return Err(ControlPlaneError::Transport(format!(
                    "reapplyGateway step failed on {worker_addr}: {}",
                    output.stderr
                )));
            }
        }
        Ok(())
    }

    /// `sendMessage(worker, containerId, payload)` — single-shot stdin
    /// injection to the instance's CLI, used by the scheduled-task runner.
    pub async fn send_message(
        &self,
        worker_addr: &str,
        container_id: &str,
        payload: &str,
    ) -> Result<()> {
        crate::util::validate_name(container_id)?;
        let encoded =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, payload.as_bytes());
        let cmd = format!(
            "printf '%s' {} | base64 -d | docker exec -i {} openclaw message --stdin",
            crate::util::shell_escape(&encoded),
            crate::util::shell_escape(container_id)
        );
        let output = self.transport.exec(worker_addr, &cmd).await?;
        if output.success() {
            Ok(())
        } else {
            Err(ControlPlaneError::Transport(format!(
                "sendMessage failed on {worker_addr}: {}",
                output.stderr
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ExecOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// In-memory stand-in for a worker filesystem, keyed by path. Parses
    /// just enough of the three command shapes `ConfigStore` issues
    /// (`cat`, a base64-stdin write, `mv`, `cp`) to exercise the store's
    /// read/write/backup logic without a real shell channel.
    struct FakeTransport {
        files: Mutex<std::collections::HashMap<String, String>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                files: Mutex::new(std::collections::HashMap::new()),
            }
        }
    }

    fn unquote(token: &str) -> String {
        token.trim_matches('\'').to_string()
    }

    #[async_trait]
    impl WorkerTransport for FakeTransport {
        async fn exec(&self, _worker_addr: &str, command: &str) -> Result<ExecOutput> {
            let mut files = self.files.lock().unwrap();
            let ok = |stdout: String| Ok(ExecOutput { stdout, stderr: String::new(), code: 0 });
            let fail = |stderr: &str| {
                Ok(ExecOutput {
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                    code: 1,
                })
            };

            if let Some(rest) = command.strip_prefix("cat ") {
                let path = unquote(rest.trim());
                return match files.get(&path) {
                    Some(contents) => ok(contents.clone()),
                    None => fail("no such file"),
                };
            }

            if let Some(rest) = command.strip_prefix("printf '%s' ") {
                // printf '%s' '<payload>' | base64 -d > '<tmp>'
                let mut parts = rest.splitn(2, " | base64 -d > ");
                let payload = unquote(parts.next().unwrap());
                let tmp = unquote(parts.next().unwrap().trim());
                let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &payload)
                    .unwrap();
                files.insert(tmp, String::from_utf8(decoded).unwrap());
                return ok(String::new());
            }

            if let Some(rest) = command.strip_prefix("mv ") {
                let mut parts = rest.split(' ');
                let src = unquote(parts.next().unwrap());
                let dst = unquote(parts.next().unwrap());
                match files.remove(&src) {
                    Some(contents) => {
                        files.insert(dst, contents);
                        ok(String::new())
                    }
                    None => fail("no such file"),
                }
            } else if let Some(rest) = command.strip_prefix("cp ") {
                let mut parts = rest.split(' ');
                let src = unquote(parts.next().unwrap());
                let dst = unquote(parts.next().unwrap());
                if let Some(contents) = files.get(&src).cloned() {
                    files.insert(dst, contents);
                }
                ok(String::new())
            } else if let Some(rest) = command.strip_prefix("rm -f ") {
                files.remove(&unquote(rest.trim()));
                ok(String::new())
            } else {
                ok(String::new())
            }
        }

        async fn upload_dir(&self, _worker_addr: &str, _local: &str, _remote: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let transport = Arc::new(FakeTransport::new());
        let store = ConfigStore::new(transport);
        let doc = json!({"gateway": {"auth": {"token": "abc"}}});
        store.write("worker-1", "/data/t1", &doc).await.unwrap();
        let read_back = store.read("worker-1", "/data/t1").await.unwrap();
        assert_eq!(read_back, doc);
    }

    #[tokio::test]
    async fn empty_write_is_refused() {
        let transport = Arc::new(FakeTransport::new());
        let store = ConfigStore::new(transport);
        let result = store.write("worker-1", "/data/t1", &json!({})).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_falls_back_to_empty_object_with_no_files() {
        let transport = Arc::new(FakeTransport::new());
        let store = ConfigStore::new(transport);
        let doc = store.read("worker-1", "/data/missing").await.unwrap();
        assert_eq!(doc, json!({}));
    }

    /// Always returns `Unreachable`, standing in for a worker that has
    /// dropped off the network mid-read.
    struct UnreachableTransport;

    #[async_trait]
    impl WorkerTransport for UnreachableTransport {
        async fn exec(&self, worker_addr: &str, _command: &str) -> Result<ExecOutput> {
            Err(ControlPlaneError::Unreachable(worker_addr.to_string()))
        }

        async fn upload_dir(&self, _worker_addr: &str, _local: &str, _remote: &str) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn read_propagates_unreachable_instead_of_falling_back() {
        let store = ConfigStore::new(Arc::new(UnreachableTransport));
        let result = store.read("worker-1", "/data/t1").await;
        assert!(matches!(result, Err(ControlPlaneError::Unreachable(_))));
    }
}
