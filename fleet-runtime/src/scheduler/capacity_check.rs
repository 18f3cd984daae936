//! Capacity-check tick (§4.8): every `capacityTick` (default 10 min),
//! grow the fleet when free RAM drops below `capacityThresholdMb`. Mirrors
//! `pickBest`'s own grow-and-retry fallback, but runs proactively instead
//! of waiting for a placement to fail first.

use std::sync::Arc;

use tracing::{info, warn};

use crate::worker::{WorkerProvisioner, WorkerRegistry};

pub struct CapacityCheckLoop {
    workers: WorkerRegistry,
    provisioner: Arc<dyn WorkerProvisioner>,
    threshold_mb: i64,
}

impl CapacityCheckLoop {
    pub fn new(workers: WorkerRegistry, provisioner: Arc<dyn WorkerProvisioner>, threshold_mb: i64) -> Self {
        Self {
            workers,
            provisioner,
            threshold_mb,
        }
    }

    /// One tick: grow the fleet once if free RAM is below the floor.
    /// Returns whether a grow happened.
    pub async fn tick(&self) -> bool {
        let free = match self.workers.free_ram_mb().await {
            Ok(free) => free,
            Err(err) => {
                warn!(%err, "capacity-check: failed to read fleet free RAM");
                return false;
            }
        };

        if free >= self.threshold_mb {
            return false;
        }

        info!(free_mb = free, threshold_mb = self.threshold_mb, "capacity-check: below floor, growing");
        match self.provisioner.grow().await {
            Ok(worker) => match self.workers.insert(&worker).await {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, worker = %worker.id, "capacity-check: grew worker but failed to register it");
                    false
                }
            },
            Err(err) => {
                warn!(%err, "capacity-check: grow failed");
                false
            }
        }
    }
}
