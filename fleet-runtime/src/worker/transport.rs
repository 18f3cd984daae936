//! One-shot command executor and file uploader against a worker host over
//! an authenticated shell channel (§4.1).

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{ControlPlaneError, Result};

/// Result of a single remote command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Authenticated shell channel against a worker host. Implementations MUST
/// treat a connect failure as `Unreachable`; a non-zero exit is a normal
/// `Ok(ExecOutput)`, interpreted by the caller.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn exec(&self, worker_addr: &str, command: &str) -> Result<ExecOutput>;

    /// Recursive, idempotent directory upload. Creates intermediate
    /// directories and preserves the relative layout under `remote_path`.
    async fn upload_dir(
        &self,
        worker_addr: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Result<()>;
}

/// Retries a connect-and-exec attempt with capped exponential backoff
/// (default 3 retries, 1s * attempt), the shape every `WorkerTransport`
/// implementation should apply around its underlying channel.
pub async fn with_retry<F, Fut, T>(
    worker_addr: &str,
    retries: u32,
    base_delay: Duration,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last_err = None;
    for n in 0..=retries {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(ControlPlaneError::Unreachable(msg)) => {
                warn!(worker = worker_addr, attempt = n, %msg, "worker unreachable, retrying");
                last_err = Some(ControlPlaneError::Unreachable(msg));
                if n < retries {
                    tokio::time::sleep(base_delay * (n + 1)).await;
                }
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_err.unwrap_or_else(|| ControlPlaneError::Unreachable(worker_addr.to_string())))
}

/// Production transport backed by multiplexed SSH sessions (one cached
/// connection per worker address, torn down on `Unreachable`).
pub struct SshTransport {
    connect_timeout: Duration,
    retries: u32,
    /// The control plane's own advertised address. Commands addressed to
    /// this address are rewritten to loopback (§4.1).
    self_address: Option<String>,
}

impl SshTransport {
    pub fn new(connect_timeout: Duration, retries: u32, self_address: Option<String>) -> Self {
        Self {
            connect_timeout,
            retries,
            self_address,
        }
    }

    fn resolve_addr<'a>(&self, worker_addr: &'a str) -> &'a str {
        match &self.self_address {
            Some(addr) if addr == worker_addr => "127.0.0.1",
            _ => worker_addr,
        }
    }

    async fn connect(&self, worker_addr: &str) -> Result<openssh::Session> {
        let addr = self.resolve_addr(worker_addr);
        tokio::time::timeout(
            self.connect_timeout,
            openssh::Session::connect_mux(addr, openssh::KnownHosts::Strict),
        )
        .await
        .map_err(|_| ControlPlaneError::Unreachable(format!("connect timed out: {addr}")))?
        .map_err(|err| ControlPlaneError::Unreachable(format!("{addr}: {err}")))
    }

    async fn run(&self, session: &openssh::Session, command: &str) -> Result<ExecOutput> {
        let output = session
            .command("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|err| ControlPlaneError::Unreachable(err.to_string()))?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

#[async_trait]
impl WorkerTransport for SshTransport {
    async fn exec(&self, worker_addr: &str, command: &str) -> Result<ExecOutput> {
        with_retry(
            worker_addr,
            self.retries,
            Duration::from_secs(1),
            || async {
                let session = self.connect(worker_addr).await?;
                let result = self.run(&session, command).await;
                let _ = session.close().await;
                result
            },
        )
        .await
    }

    async fn upload_dir(
        &self,
        worker_addr: &str,
        local_path: &str,
        remote_path: &str,
    ) -> Result<()> {
        // Tar the local directory and pipe it across as base64 stdin to a
        // remote decode-and-extract command — never a shell-interpolated
        // payload (§4.1). `remote_path` has already cleared identifier
        // validation at the call site.
        let archive = tar_directory(local_path).await?;
        let payload = BASE64.encode(&archive);

        with_retry(
            worker_addr,
            self.retries,
            Duration::from_secs(1),
            || async {
                let session = self.connect(worker_addr).await?;
                let mkdir = self
                    .run(&session, &format!("mkdir -p {}", crate::util::shell_escape(remote_path)))
                    .await?;
                if !mkdir.success() {
                    let _ = session.close().await;
                    return Err(ControlPlaneError::Transport(format!(
                        "mkdir -p {remote_path} failed on {worker_addr}: {}",
                        mkdir.stderr
                    )));
                }

                let mut child = session
                    .command("sh")
                    .arg("-c")
                    .arg(format!(
                        "base64 -d | tar -xzf - -C {}",
                        crate::util::shell_escape(remote_path)
                    ))
                    .stdin(openssh::Stdio::piped())
                    .spawn()
                    .await
                    .map_err(|err| ControlPlaneError::Unreachable(err.to_string()))?;

                if let Some(mut stdin) = child.stdin().take() {
                    stdin
                        .write_all(payload.as_bytes())
                        .await
                        .map_err(|err| ControlPlaneError::Transport(err.to_string()))?;
                    stdin
                        .shutdown()
                        .await
                        .map_err(|err| ControlPlaneError::Transport(err.to_string()))?;
                }

                let status = child
                    .wait()
                    .await
                    .map_err(|err| ControlPlaneError::Transport(err.to_string()))?;
                let _ = session.close().await;

                if status.success() {
                    Ok(())
                } else {
                    Err(ControlPlaneError::Transport(format!(
                        "extract to {remote_path} on {worker_addr} failed: {status}"
                    )))
                }
            },
        )
        .await
    }
}

/// Build an in-memory gzip tarball of `local_path`, rooted at its entries
/// so extraction preserves the relative layout under the destination.
async fn tar_directory(local_path: &str) -> Result<Vec<u8>> {
    let local_path = local_path.to_string();
    tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        {
            let encoder = flate2::write::GzEncoder::new(&mut buf, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder
                .append_dir_all(".", &local_path)
                .map_err(|err| ControlPlaneError::Transport(err.to_string()))?;
            builder
                .into_inner()
                .map_err(|err| ControlPlaneError::Transport(err.to_string()))?
                .finish()
                .map_err(|err| ControlPlaneError::Transport(err.to_string()))?;
        }
        Ok(buf)
    })
    .await
    .map_err(|err| ControlPlaneError::Transport(err.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn with_retry_retries_only_on_unreachable() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<()> = with_retry("worker-1", 2, Duration::from_millis(1), move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ControlPlaneError::Unreachable("down".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_stops_immediately_on_non_unreachable_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<()> = with_retry("worker-1", 5, Duration::from_millis(1), move || {
            let attempts = attempts_clone.clone();
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ControlPlaneError::InvariantViolation("bad arg".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_retry_returns_ok_on_eventual_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let result = with_retry("worker-1", 3, Duration::from_millis(1), move || {
            let attempts = attempts_clone.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ControlPlaneError::Unreachable("down".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn tar_directory_round_trips_a_small_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"world").unwrap();

        let archive = tar_directory(dir.path().to_str().unwrap()).await.unwrap();
        assert!(!archive.is_empty());
    }
}
