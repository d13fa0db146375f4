//! Background liveness monitor.
//!
//! One tokio task ticks on two cadences: the heartbeat check, which moves the
//! gate into lockdown when monitoring goes quiet, and the expiry sweep, which
//! re-locks files whose grants ran out even if nobody asks about them. Gate
//! calls touch the filesystem and the ledger, so they run on the blocking
//! pool.

use crate::error::Result;
use crate::gate::ProtectionGate;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct HeartbeatSupervisor;

impl HeartbeatSupervisor {
    /// Start supervising with the intervals from the gate's configuration.
    pub fn spawn(gate: Arc<ProtectionGate>) -> SupervisorHandle {
        let check_every = gate.config().heartbeat_check_interval();
        let sweep_every = gate.config().cleanup_interval();
        Self::spawn_with_intervals(gate, check_every, sweep_every)
    }

    pub fn spawn_with_intervals(
        gate: Arc<ProtectionGate>,
        check_every: Duration,
        sweep_every: Duration,
    ) -> SupervisorHandle {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(gate, check_every, sweep_every, cancel.clone()));
        SupervisorHandle { cancel, task }
    }
}

/// Owner of a running supervisor. Dropping the handle does not stop the
/// task; call [`SupervisorHandle::shutdown`].
#[derive(Debug)]
pub struct SupervisorHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// A token that stops the supervisor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the timers and wait for the task to exit.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        self.task.await?;
        Ok(())
    }
}

async fn run(
    gate: Arc<ProtectionGate>,
    check_every: Duration,
    sweep_every: Duration,
    cancel: CancellationToken,
) {
    info!(
        "Heartbeat supervisor started: check every {:?}, sweep every {:?}",
        check_every, sweep_every
    );

    let mut check_tick = interval(check_every);
    check_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sweep_tick = interval(sweep_every);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = check_tick.tick() => {
                let gate = gate.clone();
                match tokio::task::spawn_blocking(move || gate.check_liveness()).await {
                    Ok(Some(report)) => warn!(
                        "Lockdown complete: {} grant(s) cleared, {} file(s) locked, {} failure(s)",
                        report.grants_cleared,
                        report.files.locked,
                        report.files.failures.len()
                    ),
                    Ok(None) => {}
                    Err(e) => error!("Liveness check failed: {}", e),
                }
            }
            _ = sweep_tick.tick() => {
                let gate = gate.clone();
                match tokio::task::spawn_blocking(move || gate.cleanup_expired()).await {
                    Ok(report) if report.is_clean() => {
                        if report.expired > 0 {
                            debug!("Swept {} expired grant(s)", report.expired);
                        }
                    }
                    Ok(report) => {
                        for (path, reason) in &report.failures {
                            error!("Expired grant on {:?} not fully retired: {}", path, reason);
                        }
                    }
                    Err(e) => error!("Expiry sweep failed: {}", e),
                }
            }
        }
    }

    info!("Heartbeat supervisor stopped");
}
