//! Background reconciliation loops (§4.8): sleep reclaim, capacity check,
//! and scheduled tasks. Each tick runs to completion inline in its own
//! loop before the next `interval.tick()` is awaited, so a slow tick can
//! never overlap its successor — `MissedTickBehavior::Skip` makes the
//! next `tick()` return immediately once, rather than bursting through
//! every interval that elapsed while the previous tick was running (§5
//! "a tick may overlap its successor only if... skipped, not queued").

pub mod capacity_check;
pub mod scheduled_tasks;
pub mod sleep_reclaim;

pub use capacity_check::CapacityCheckLoop;
pub use scheduled_tasks::{ScheduledTask, ScheduledTaskRepository, ScheduledTasksLoop, UsageLedger};
pub use sleep_reclaim::SleepReclaimLoop;

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

/// Spawn a ticker that calls `tick` on every `interval`, skipping rather
/// than queuing ticks missed while the previous call was still running.
pub fn spawn_ticker<F, Fut>(name: &'static str, interval: Duration, mut tick: F)
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            tracing::info!(loop_name = name, "tick start");
            tick().await;
        }
    });
}
