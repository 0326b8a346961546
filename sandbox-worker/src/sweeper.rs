use crate::worker::Shutdown;
use chrono::Utc;
use sandbox_orchestrator::LeaseSweeper;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info};

/// Reclaim expired leases every `interval_secs` until shutdown.
pub async fn start_sweeper_task(sweeper: LeaseSweeper, interval_secs: u64, mut shutdown: Shutdown) {
    let mut interval = interval(Duration::from_secs(interval_secs));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Lease sweeper running (checks every {} seconds)",
        interval_secs
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        match sweeper.sweep(Utc::now()).await {
            Ok(report) if report.is_empty() => {}
            Ok(report) => info!(
                "Sweep reclaimed leases: {} requeued, {} failed, {} abandoned",
                report.requeued, report.failed, report.abandoned
            ),
            Err(e) => error!("Lease sweep failed: {}", e),
        }
    }

    info!("Lease sweeper stopped");
}
