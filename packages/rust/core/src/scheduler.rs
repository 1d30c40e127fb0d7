//! Periodic refresh ticker.
//!
//! The ticker is just another caller of [`PipelineController::trigger`], so a
//! tick that lands while a run is in flight is dropped by the gate.

use std::sync::Arc;
use std::time::Duration;

use feedwatch_shared::RefreshRequest;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::controller::PipelineController;

/// Handle to a running ticker. Dropping it stops the ticker.
#[derive(Debug)]
pub struct SchedulerHandle {
    task: JoinHandle<()>,
    period: Duration,
}

impl SchedulerHandle {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Stop ticking. A run already in flight is left to finish.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Trigger `request` every `period`, first one period after start.
pub fn spawn_scheduler(
    controller: Arc<PipelineController>,
    period: Duration,
    request: RefreshRequest,
) -> SchedulerHandle {
    info!(period_secs = period.as_secs(), "scheduler started");
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = controller.trigger(request);
            if outcome.started {
                debug!(run_id = ?outcome.run_id, "scheduled refresh started");
            } else {
                info!("scheduled refresh skipped, previous run still active");
            }
        }
    });
    SchedulerHandle { task, period }
}
