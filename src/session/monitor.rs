//! Watchdog over hardware stages

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::RecvTimeoutError;
use tracing::{error, info};

use super::host::{HostBridge, Notification};
use crate::hw::HardwareStage;
use crate::pipeline::{PipelineContext, StageHealth};
use crate::stage::StageId;
use crate::MonitorConfig;

pub(crate) struct HealthMonitor {
    pub(crate) stages: Vec<(StageId, Arc<StageHealth>, Arc<dyn HardwareStage>)>,
    pub(crate) ctx: Arc<PipelineContext>,
    pub(crate) host: Arc<HostBridge>,
    pub(crate) config: MonitorConfig,
    /// Closed or signalled when the session stops
    pub(crate) stop: flume::Receiver<()>,
}

impl HealthMonitor {
    pub(crate) fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("health".into())
            .spawn(move || self.run())
    }

    fn run(self) {
        let interval = Duration::from_millis(self.config.interval_ms.max(1));
        loop {
            match self.stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Some((stage, reason)) = self.check(Instant::now()) {
                        self.raise(stage, reason);
                        return;
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Health monitor stopped");
    }

    fn check(&self, now: Instant) -> Option<(StageId, String)> {
        let watchdog = Duration::from_millis(self.config.watchdog_ms);
        for (stage, health, hw) in &self.stages {
            if let Some(reason) = hw.fault() {
                return Some((*stage, reason));
            }
            if let Some(stalled) = health.stalled_for(now) {
                if stalled > watchdog {
                    return Some((
                        *stage,
                        format!(
                            "no completion for {}ms with {} jobs in flight",
                            stalled.as_millis(),
                            health.in_flight()
                        ),
                    ));
                }
            }
        }
        None
    }

    /// Faults are fatal: report once and let the host close the session.
    fn raise(&self, stage: StageId, reason: String) {
        error!(%stage, %reason, "Pipeline fault");
        error!("Pipeline state at fault:\n{}", self.ctx.dump());
        self.host.set_faulted();
        self.host.notify(Notification::Error {
            stage: Some(stage),
            reason,
        });
    }
}
