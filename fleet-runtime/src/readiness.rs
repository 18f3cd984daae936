//! Ambient HTTP surface (§4.9, SPEC_FULL §14): `GET /healthz` for process
//! liveness and `GET /readyz/:tenantId` for the caller-driven readiness
//! probe. The only HTTP surface this crate owns — router shape and error
//! mapping follow the teacher's `operator_api` axum conventions, trimmed
//! to the two unauthenticated endpoints this domain actually needs.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::edge::EdgeReconciler;
use crate::error::{ControlPlaneError, Result, user_facing_message};
use crate::instance::{InstanceRepository, InstanceState};
use crate::worker::{WorkerRegistry, WorkerTransport};

#[derive(Clone)]
pub struct ReadinessState {
    instances: InstanceRepository,
    workers: WorkerRegistry,
    transport: Arc<dyn WorkerTransport>,
    edge: Arc<EdgeReconciler>,
    edge_domain: String,
}

impl ReadinessState {
    pub fn new(
        instances: InstanceRepository,
        workers: WorkerRegistry,
        transport: Arc<dyn WorkerTransport>,
        edge: Arc<EdgeReconciler>,
        edge_domain: String,
    ) -> Self {
        Self {
            instances,
            workers,
            transport,
            edge,
            edge_domain,
        }
    }

    /// `readyz(tenantId)` (§4.9). Returns the probe outcome as one of
    /// `active` / `starting` / `provisioning` / `traefik_fixed`.
    async fn probe(&self, tenant_id: &str) -> Result<&'static str> {
        let record = self
            .instances
            .get(tenant_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(tenant_id.to_string()))?;
        let state = record.state()?;

        if !matches!(state, InstanceState::Provisioning | InstanceState::Starting) {
            return if state == InstanceState::Active {
                Ok("active")
            } else {
                Err(ControlPlaneError::Conflict(format!(
                    "tenant {tenant_id} is {}",
                    state.as_str()
                )))
            };
        }

        let worker = self
            .workers
            .get(&record.worker_id)
            .await?
            .ok_or_else(|| ControlPlaneError::NotProvisioned(record.worker_id.clone()))?;
        crate::util::validate_name(&record.container_id)?;

        let running_cmd = format!(
            "docker inspect -f '{{{{.State.Running}}}}' {}",
            crate::util::shell_escape(&record.container_id)
        );
        let running = self.transport.exec(&worker.address, &running_cmd).await?;
        if !(running.success() && running.stdout.trim() == "true") {
            return Ok(state.as_str());
        }

        let probe_cmd = format!(
            "curl -s -o /dev/null -w '%{{http_code}}' -H 'Host: {subdomain}.{domain}' http://localhost/",
            subdomain = record.subdomain,
            domain = self.edge_domain,
        );
        let probed = self.transport.exec(&worker.address, &probe_cmd).await?;
        let http_code = probed.stdout.lines().last().unwrap_or("000");

        match http_code {
            "200" | "101" => {
                let promoted = self
                    .instances
                    .compare_and_set_state(
                        tenant_id,
                        &[InstanceState::Provisioning, InstanceState::Starting],
                        InstanceState::Active,
                    )
                    .await?;
                if promoted {
                    self.instances.reset_retries(tenant_id).await.ok();
                    self.instances.touch(tenant_id).await.ok();
                }
                Ok("active")
            }
            "404" | "000" => {
                warn!(tenant = tenant_id, worker = %worker.address, http_code, "readyz: edge proxy misrouting");
                self.edge.ensure_edge(&worker.address).await.ok();
                Ok("traefik_fixed")
            }
            _ => {
                info!(tenant = tenant_id, http_code, "readyz: not yet ready");
                Ok(state.as_str())
            }
        }
    }
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyBody {
    state: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthBody { status: "ok" }))
}

async fn readyz(State(state): State<ReadinessState>, Path(tenant_id): Path<String>) -> impl IntoResponse {
    match state.probe(&tenant_id).await {
        Ok(outcome) => (StatusCode::OK, Json(ReadyBody { state: outcome })).into_response(),
        Err(err) => api_error(&err).into_response(),
    }
}

fn api_error(err: &ControlPlaneError) -> (StatusCode, Json<ErrorBody>) {
    let status = match err {
        ControlPlaneError::NotProvisioned(_) | ControlPlaneError::Conflict(_) => StatusCode::CONFLICT,
        ControlPlaneError::NoCapacity(_) => StatusCode::SERVICE_UNAVAILABLE,
        ControlPlaneError::Validation(_) | ControlPlaneError::InvariantViolation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorBody { error: user_facing_message(err) }))
}

/// Build CORS from `CORS_ALLOWED_ORIGINS` (comma-separated). Unset or `"*"`
/// allows any origin, for local/dev runs.
fn build_cors_layer() -> CorsLayer {
    let allowed = CorsLayer::new()
        .allow_methods(vec![Method::GET])
        .allow_headers(vec![header::ACCEPT]);

    let origins_env = std::env::var("CORS_ALLOWED_ORIGINS").unwrap_or_default();
    if origins_env.is_empty() || origins_env == "*" {
        allowed.allow_origin(AllowOrigin::any())
    } else {
        let origins: Vec<_> = origins_env
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        allowed.allow_origin(AllowOrigin::list(origins))
    }
}

/// This surface is polled heavily by external load balancers and the
/// caller-driven `/readyz` probe, so it carries its own concurrency cap,
/// request timeout, and request tracing independent of anything the rest of
/// the crate does over the worker transport.
pub fn router(state: ReadinessState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz/{tenant_id}", get(readyz))
        .layer(ConcurrencyLimitLayer::new(64))
        .layer(TimeoutLayer::new(Duration::from_secs(5)))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_always_reports_ok() {
        let app = Router::new().route("/healthz", get(healthz));
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn api_error_maps_not_provisioned_to_conflict() {
        let (status, _) = api_error(&ControlPlaneError::NotProvisioned("t1".to_string()));
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[test]
    fn api_error_maps_no_capacity_to_service_unavailable() {
        let (status, _) = api_error(&ControlPlaneError::NoCapacity("fleet full".to_string()));
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
