//! Control-plane daemon: loads configuration, wires the scheduler and
//! lifecycle core to Postgres and the worker fleet, serves the readiness
//! surface, and runs the three background reconciliation loops until
//! SIGTERM.

use std::sync::Arc;

use fleet_runtime::collaborators::{HttpDnsProvider, HttpPaymentAttestation, HttpWorkerProvisioner, ShellEdgeProxy};
use fleet_runtime::config::ControlPlaneConfig;
use fleet_runtime::config_store::ConfigStore;
use fleet_runtime::edge::EdgeReconciler;
use fleet_runtime::instance::{InstanceRepository, InstanceState, LifecycleController, Provisioner};
use fleet_runtime::readiness::{self, ReadinessState};
use fleet_runtime::scheduler::{CapacityCheckLoop, ScheduledTaskRepository, ScheduledTasksLoop, SleepReclaimLoop, spawn_ticker};
use fleet_runtime::worker::{SshTransport, WorkerRegistry, WorkerTransport};
use tracing::{error, info, warn};

const DISCOVERY_NETWORK: &str = "openclaw-discovery";

#[tokio::main]
async fn main() {
    setup_log();

    let config = ControlPlaneConfig::load();

    let pool = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            error!(%err, "failed to connect to database, exiting");
            std::process::exit(1);
        }
    };

    let transport: Arc<dyn WorkerTransport> = Arc::new(SshTransport::new(
        config.transport_timeout,
        config.transport_retries,
        std::env::var("SELF_ADDRESS").ok(),
    ));

    let instances = InstanceRepository::new(pool.clone());
    let workers = WorkerRegistry::new(pool.clone());
    let config_store = Arc::new(ConfigStore::new(transport.clone()));

    let edge = Arc::new(EdgeReconciler::new(
        Box::new(ShellEdgeProxy::new(transport.clone(), DISCOVERY_NETWORK)),
        match HttpDnsProvider::from_env(config.edge_domain.clone()) {
            Ok(dns) => Box::new(dns),
            Err(err) => {
                error!(%err, "failed to configure DNS provider, exiting");
                std::process::exit(1);
            }
        },
    ));

    let worker_provisioner: Arc<dyn fleet_runtime::worker::WorkerProvisioner> =
        match HttpWorkerProvisioner::from_env() {
            Ok(provisioner) => Arc::new(provisioner),
            Err(err) => {
                error!(%err, "failed to configure worker provisioner, exiting");
                std::process::exit(1);
            }
        };
    let billing: Arc<dyn fleet_runtime::instance::PaymentAttestation> =
        Arc::new(HttpPaymentAttestation::from_env());

    let platform_secret = match std::env::var("PLATFORM_SECRET") {
        Ok(secret) => secret.into_bytes(),
        Err(_) => {
            error!("PLATFORM_SECRET is required, exiting");
            std::process::exit(1);
        }
    };

    let provisioner = Arc::new(Provisioner::new(
        instances.clone(),
        workers.clone(),
        transport.clone(),
        config_store.clone(),
        edge.clone(),
        worker_provisioner.clone(),
        billing,
        config,
        platform_secret,
    ));

    let lifecycle = Arc::new(LifecycleController::new(
        instances.clone(),
        workers.clone(),
        transport.clone(),
        config_store.clone(),
        provisioner.clone(),
        config,
    ));

    reconcile_on_startup(&instances, &workers, &transport).await;

    spawn_scheduler_loops(config, &instances, &workers, &config_store, &lifecycle, &worker_provisioner, pool.clone());

    let readiness_state = ReadinessState::new(
        instances.clone(),
        workers.clone(),
        transport.clone(),
        edge.clone(),
        config.edge_domain.clone(),
    );
    let app = readiness::router(readiness_state);
    let listener = match tokio::net::TcpListener::bind(&config.readiness_bind).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, bind = %config.readiness_bind, "failed to bind readiness surface, exiting");
            std::process::exit(1);
        }
    };
    info!(bind = %config.readiness_bind, "readiness surface listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        error!(%err, "readiness server exited with error");
    }
    info!("shutdown complete");
}

/// Startup reconciliation (§9 "Open question — resolved"): recompute every
/// worker's RAM accounting from the instances table, then walk every placed
/// instance and compare its recorded state against the worker's live
/// process list, logging (and where safe, correcting) discrepancies —
/// matching the teacher's own `reaper::reconcile_on_startup` pattern of
/// syncing DB state against Docker truth at boot, adapted from `bollard`
/// inspection to this crate's `WorkerTransport`.
async fn reconcile_on_startup(
    instances: &InstanceRepository,
    workers: &WorkerRegistry,
    transport: &Arc<dyn WorkerTransport>,
) {
    let worker_ids = instances.placed_worker_ids().await.unwrap_or_default();

    for worker_id in worker_ids {
        if let Err(err) = workers.refresh(&worker_id).await {
            error!(%err, worker = %worker_id, "startup reconcile: refresh failed");
        }
    }

    let records = match instances.placed_instances().await {
        Ok(records) => records,
        Err(err) => {
            error!(%err, "startup reconcile: failed to list placed instances");
            return;
        }
    };

    for record in records {
        let Ok(state) = record.state() else { continue };
        let worker = match workers.get(&record.worker_id).await {
            Ok(Some(worker)) => worker,
            Ok(None) => {
                warn!(tenant = %record.tenant_id, worker = %record.worker_id, "startup reconcile: worker record missing");
                continue;
            }
            Err(err) => {
                error!(%err, tenant = %record.tenant_id, "startup reconcile: worker lookup failed");
                continue;
            }
        };
        if fleet_runtime::util::validate_name(&record.container_id).is_err() {
            continue;
        }

        let cmd = format!(
            "docker inspect -f '{{{{.State.Running}}}}' {}",
            fleet_runtime::util::shell_escape(&record.container_id)
        );
        let running = match transport.exec(&worker.address, &cmd).await {
            Ok(out) if out.success() => out.stdout.trim() == "true",
            Ok(_) => {
                warn!(tenant = %record.tenant_id, container = %record.container_id, "startup reconcile: container gone");
                continue;
            }
            Err(err) => {
                warn!(tenant = %record.tenant_id, %err, "startup reconcile: worker unreachable, skipping");
                continue;
            }
        };

        let should_be_running = matches!(
            state,
            InstanceState::Provisioning | InstanceState::Starting | InstanceState::Active
        );
        if running && state == InstanceState::Sleeping {
            warn!(tenant = %record.tenant_id, "startup reconcile: container running but record is sleeping");
        } else if !running && should_be_running {
            warn!(tenant = %record.tenant_id, state = state.as_str(), "startup reconcile: container not running, marking for re-provision");
            if let Err(err) = instances.mark_provisioning_failed(&record.tenant_id).await {
                error!(%err, tenant = %record.tenant_id, "startup reconcile: failed to mark for re-provision");
            }
        }
    }

    info!("startup reconciliation complete");
}

#[allow(clippy::too_many_arguments)]
fn spawn_scheduler_loops(
    config: &'static ControlPlaneConfig,
    instances: &InstanceRepository,
    workers: &WorkerRegistry,
    config_store: &Arc<ConfigStore>,
    lifecycle: &Arc<LifecycleController>,
    worker_provisioner: &Arc<dyn fleet_runtime::worker::WorkerProvisioner>,
    pool: sqlx::PgPool,
) {
    let sleep_reclaim = Arc::new(SleepReclaimLoop::new(
        instances.clone(),
        lifecycle.clone(),
        config.idle_threshold,
    ));
    spawn_ticker("sleep-reclaim", config.sleep_tick, move || {
        let sleep_reclaim = sleep_reclaim.clone();
        async move {
            let reclaimed = sleep_reclaim.tick().await;
            info!(reclaimed, "sleep-reclaim tick complete");
        }
    });

    let capacity_check = Arc::new(CapacityCheckLoop::new(
        workers.clone(),
        worker_provisioner.clone(),
        config.capacity_threshold_mb,
    ));
    spawn_ticker("capacity-check", config.capacity_tick, move || {
        let capacity_check = capacity_check.clone();
        async move {
            let grew = capacity_check.tick().await;
            info!(grew, "capacity-check tick complete");
        }
    });

    let scheduled_tasks = Arc::new(ScheduledTasksLoop::new(
        instances.clone(),
        workers.clone(),
        config_store.clone(),
        lifecycle.clone(),
        ScheduledTaskRepository::new(pool),
        Arc::new(LoggingUsageLedger),
    ));
    spawn_ticker("scheduled-tasks", config.cron_tick, move || {
        let scheduled_tasks = scheduled_tasks.clone();
        async move {
            let ran = scheduled_tasks.tick().await;
            info!(ran, "scheduled-tasks tick complete");
        }
    });
}

/// Logs scheduled-task outcomes; a real billing ledger is out of scope
/// here (§1) since `sendMessage` has no cost-per-call figure to record.
struct LoggingUsageLedger;

#[async_trait::async_trait]
impl fleet_runtime::scheduler::UsageLedger for LoggingUsageLedger {
    async fn record(&self, tenant_id: &str, task_id: &str, success: bool) -> fleet_runtime::Result<()> {
        info!(tenant = tenant_id, task = task_id, success, "scheduled task outcome");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, completing in-flight ticks");
}

fn setup_log() {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{EnvFilter, fmt};
    if tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .is_err()
    {}
}
