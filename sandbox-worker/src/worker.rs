//! Worker sessions: each one repeatedly claims and executes the oldest
//! eligible operation.

use sandbox_orchestrator::{AttemptOutcome, CloudProvider, ExecutionEngine, SandboxOrchestrator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// Set to `true` to stop the pool. In-flight remote waits observe it too.
pub type Shutdown = watch::Receiver<bool>;

/// Session id unique to this process and slot.
pub fn session_id(slot: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("worker-{}-{}", slot, &suffix[..8])
}

/// Spawn `workers` sessions sharing one provider.
pub fn start_worker_pool(
    orchestrator: &SandboxOrchestrator,
    provider: Arc<dyn CloudProvider>,
    workers: usize,
    idle_poll: Duration,
    shutdown: Shutdown,
) -> Vec<JoinHandle<()>> {
    (0..workers)
        .map(|slot| {
            let engine = orchestrator.engine(provider.clone());
            let session = session_id(slot);
            let span = info_span!("worker", session = %session);
            tokio::spawn(run_worker(engine, session, idle_poll, shutdown.clone()).instrument(span))
        })
        .collect()
}

pub async fn run_worker(
    engine: ExecutionEngine,
    session: String,
    idle_poll: Duration,
    mut shutdown: Shutdown,
) {
    info!("Worker {} started (idle poll {:?})", session, idle_poll);

    while !*shutdown.borrow() {
        match engine.run_once(&session, shutdown.clone()).await {
            Ok(Some(outcome)) => {
                log_outcome(&outcome);
                continue;
            }
            Ok(None) => {}
            Err(e) => error!("Worker {} attempt failed: {}", session, e),
        }

        tokio::select! {
            _ = tokio::time::sleep(idle_poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!("Worker {} stopped", session);
}

fn log_outcome(outcome: &AttemptOutcome) {
    match outcome {
        AttemptOutcome::Succeeded {
            operation_id,
            released,
        } => info!("Operation {} done ({} released)", operation_id, released),
        AttemptOutcome::RetryScheduled {
            operation_id,
            try_count,
            ..
        } => info!("Operation {} requeued after try {}", operation_id, try_count),
        AttemptOutcome::Failed { operation_id, .. } => {
            info!("Operation {} failed", operation_id)
        }
        AttemptOutcome::Abandoned { operation_id, .. } => {
            info!("Operation {} abandoned", operation_id)
        }
        AttemptOutcome::LeaseLost { operation_id } => {
            info!("Lost the lease on {}", operation_id)
        }
    }
}
