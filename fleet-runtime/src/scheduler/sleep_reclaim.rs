//! Sleep-reclaim tick (§4.8): every `sleepTick` (default 5 min), sleep any
//! tenant that has been `active` longer than `idleThreshold` without
//! activity. Grounded on the teacher's idle-timeout half of `reaper_tick`,
//! minus the hard-lifetime kill and snapshot-before-stop steps this
//! domain has no counterpart for.

use std::sync::Arc;

use tracing::{info, warn};

use crate::instance::{InstanceRepository, LifecycleController};

pub struct SleepReclaimLoop {
    instances: InstanceRepository,
    lifecycle: Arc<LifecycleController>,
    idle_threshold: chrono::Duration,
}

impl SleepReclaimLoop {
    pub fn new(
        instances: InstanceRepository,
        lifecycle: Arc<LifecycleController>,
        idle_threshold: std::time::Duration,
    ) -> Self {
        Self {
            instances,
            lifecycle,
            idle_threshold: chrono::Duration::from_std(idle_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(30)),
        }
    }

    /// One tick: sleep every idle-active tenant, tolerating individual
    /// failures so one stuck worker doesn't stall the rest of the fleet.
    pub async fn tick(&self) -> usize {
        let idle = match self.instances.idle_active_tenants(self.idle_threshold).await {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "sleep-reclaim: failed to list idle tenants");
                return 0;
            }
        };

        let mut reclaimed = 0;
        for record in idle {
            match self.lifecycle.sleep(&record.tenant_id).await {
                Ok(()) => {
                    reclaimed += 1;
                    info!(tenant = %record.tenant_id, "sleep-reclaim: put tenant to sleep");
                }
                Err(err) => warn!(tenant = %record.tenant_id, %err, "sleep-reclaim: failed to sleep tenant"),
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_threshold_conversion_falls_back_on_overflow() {
        let converted = chrono::Duration::from_std(std::time::Duration::from_secs(1800));
        assert_eq!(converted, Ok(chrono::Duration::minutes(30)));
    }
}
