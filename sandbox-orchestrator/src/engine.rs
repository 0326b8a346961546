//! Execution engine: drives one operation attempt from claim to settle.
//!
//! ```text
//! Pending ──claim──▶ InProgress ──success──────────────▶ Done (dependents released)
//!                        │ ──transient, tries left──────▶ Pending (after backoff)
//!                        │ ──terminal / tries exhausted─▶ Failed (dependents abandoned)
//!                        └ ──transient, batch abandoned─▶ Abandoned
//! ```
//!
//! The remote wait is bounded by the timeout policy and observes a
//! cooperative cancellation signal. Every settle happens in one transaction
//! together with the resource update, presenting the lease taken at claim.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::lease::Lease;
use crate::operation::{self, Operation, OperationKind, OperationLog, OperationStatus};
use crate::phase;
use crate::provider::{CloudProvider, ProviderError, ProviderHandle, RemoteStatus, ResourceDescriptor};
use crate::resource::{self, Resource, ResourceStatus, StatusUpdate};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Flipping the sender to `true` cancels the attempts watching it.
pub type CancelSignal = watch::Receiver<bool>;

/// A signal that never fires.
pub fn never_cancelled() -> CancelSignal {
    let (_tx, rx) = watch::channel(false);
    rx
}

const DISPATCH_SCAN_LIMIT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded {
        operation_id: String,
        released: u64,
    },
    RetryScheduled {
        operation_id: String,
        try_count: u32,
        reason: String,
    },
    Failed {
        operation_id: String,
        reason: String,
        abandoned: Vec<String>,
    },
    Abandoned {
        operation_id: String,
        reason: String,
    },
    /// The lease was reclaimed before the attempt could commit.
    LeaseLost {
        operation_id: String,
    },
}

impl AttemptOutcome {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Succeeded { operation_id, .. }
            | Self::RetryScheduled { operation_id, .. }
            | Self::Failed { operation_id, .. }
            | Self::Abandoned { operation_id, .. }
            | Self::LeaseLost { operation_id } => operation_id,
        }
    }
}

struct RemoteSuccess {
    external_id: Option<String>,
    provisioning_state: Option<String>,
}

#[derive(Clone)]
pub struct ExecutionEngine {
    pool: SqlitePool,
    log: OperationLog,
    provider: Arc<dyn CloudProvider>,
    config: OrchestratorConfig,
}

impl ExecutionEngine {
    pub fn new(pool: SqlitePool, provider: Arc<dyn CloudProvider>, config: OrchestratorConfig) -> Self {
        Self {
            log: OperationLog::new(pool.clone()),
            pool,
            provider,
            config,
        }
    }

    /// Claim the oldest eligible operation and execute it. Returns `None`
    /// when there is nothing to do (or every candidate was taken by someone
    /// else first).
    pub async fn run_once(
        &self,
        session: &str,
        cancel: CancelSignal,
    ) -> Result<Option<AttemptOutcome>> {
        for candidate in self.log.list_eligible(DISPATCH_SCAN_LIMIT).await? {
            // Another session may have claimed or even settled it since the listing.
            let op = self.log.get(&candidate.id).await?;
            if op.status != OperationStatus::Pending {
                continue;
            }
            match self.attempt(op, session, cancel.clone()).await {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(e) if e.is_conflict() => {
                    debug!("Lost claim race for {}: {}", candidate.id, e);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping {} this round: {}", candidate.id, e);
                    continue;
                }
            }
        }
        Ok(None)
    }

    /// Execute one attempt of a specific operation.
    pub async fn execute(
        &self,
        operation_id: &str,
        session: &str,
        cancel: CancelSignal,
    ) -> Result<AttemptOutcome> {
        let op = self.log.get(operation_id).await?;
        self.attempt(op, session, cancel).await
    }

    #[instrument(
        skip_all,
        fields(
            operation_id = %op.id,
            sandbox_id = %op.sandbox_id,
            batch_id = %op.batch_id,
            session = session,
            provider = self.provider.name()
        )
    )]
    async fn attempt(
        &self,
        op: Operation,
        session: &str,
        cancel: CancelSignal,
    ) -> Result<AttemptOutcome> {
        let target = self.resource(&op.resource_id).await?;

        if op.status == OperationStatus::Pending && target.status.is_terminal() {
            return self.abandon_for_terminal_resource(&op, &target).await;
        }

        let timeout = self.config.timeouts.resolve(target.resource_type, op.kind);
        let lease = self.claim(&op, &target, session, timeout).await?;
        let target = self.resource(&op.resource_id).await?;

        info!(
            "Executing {:?} of {} {} (try {}/{}, timeout {:?})",
            op.kind,
            target.resource_type,
            target.resource_key,
            lease.try_count,
            op.max_try_count,
            timeout
        );

        let result = self.run_remote(&op, &target, &lease, timeout, cancel).await;

        if lease.is_expired(Utc::now()) {
            warn!("Lease on {} expired during the remote wait", op.id);
        }

        let settled = match result {
            Ok(success) => self.settle_success(&op, &target, &lease, success).await,
            Err(e) if e.is_transient() && lease.try_count < op.max_try_count => {
                self.settle_retry(&op, &lease, &e).await
            }
            Err(e) => self.settle_failure(&op, &lease, &e).await,
        };

        let outcome = match settled {
            Ok(outcome) => outcome,
            Err(OrchestratorError::LeaseExpired(reason)) => {
                warn!("Discarding result of {}: {}", op.id, reason);
                AttemptOutcome::LeaseLost {
                    operation_id: op.id.clone(),
                }
            }
            Err(e) => return Err(e),
        };

        self.log_phase(&op.sandbox_id).await;
        Ok(outcome)
    }

    async fn resource(&self, id: &str) -> Result<Resource> {
        let mut conn = self.pool.acquire().await?;
        resource::fetch_by_id(&mut conn, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    /// Claim the row and move the resource into its in-flight status in one
    /// transaction.
    async fn claim(
        &self,
        op: &Operation,
        target: &Resource,
        session: &str,
        timeout: std::time::Duration,
    ) -> Result<Lease> {
        let mut tx = self.pool.begin().await?;
        let lease = operation::claim_in(&mut tx, op, session, self.config.lease.lease_for(timeout)).await?;

        let in_flight = match op.kind {
            OperationKind::Create if target.status == ResourceStatus::Pending => {
                Some(ResourceStatus::Provisioning)
            }
            OperationKind::Delete => Some(ResourceStatus::Deleting),
            _ => None,
        };
        if let Some(next) = in_flight {
            resource::transition(&mut tx, &target.id, next, StatusUpdate::default()).await?;
        }

        tx.commit().await?;
        Ok(lease)
    }

    async fn run_remote(
        &self,
        op: &Operation,
        target: &Resource,
        lease: &Lease,
        timeout: std::time::Duration,
        mut cancel: CancelSignal,
    ) -> std::result::Result<RemoteSuccess, ProviderError> {
        let deadline = Instant::now() + timeout;
        let descriptor = ResourceDescriptor::from(target);

        let handle = bounded(
            deadline,
            timeout,
            &mut cancel,
            self.provider.submit(target.resource_type, op.kind, &descriptor),
        )
        .await?;

        if let Err(e) = self.log.record_submission(lease, &handle).await {
            warn!("Could not record provider handle for {}: {}", op.id, e);
        }

        let result = bounded(deadline, timeout, &mut cancel, self.wait_for_terminal(&handle)).await;

        if matches!(result, Err(ProviderError::Timeout(_) | ProviderError::Cancelled)) {
            if let Err(e) = self.provider.cancel(&handle).await {
                warn!("Provider cancel of {} failed: {}", handle.as_str(), e);
            }
        }

        result
    }

    async fn wait_for_terminal(
        &self,
        handle: &ProviderHandle,
    ) -> std::result::Result<RemoteSuccess, ProviderError> {
        loop {
            match self.provider.poll_status(handle).await? {
                RemoteStatus::InProgress { provisioning_state } => {
                    debug!(
                        "{} still in progress ({})",
                        handle.as_str(),
                        provisioning_state.as_deref().unwrap_or("unknown")
                    );
                    tokio::time::sleep(self.config.poll_interval()).await;
                }
                RemoteStatus::Succeeded {
                    external_id,
                    provisioning_state,
                } => {
                    return Ok(RemoteSuccess {
                        external_id,
                        provisioning_state,
                    })
                }
                RemoteStatus::Failed { message, retryable } => {
                    return Err(if retryable {
                        ProviderError::Transient(message)
                    } else {
                        ProviderError::Terminal(message)
                    })
                }
            }
        }
    }

    async fn settle_success(
        &self,
        op: &Operation,
        target: &Resource,
        lease: &Lease,
        success: RemoteSuccess,
    ) -> Result<AttemptOutcome> {
        let mut tx = self.pool.begin().await?;
        operation::release_in(&mut tx, lease, OperationStatus::Done, None, None).await?;

        let current = resource::fetch_by_id(&mut tx, &target.id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(target.id.clone()))?;
        let update = StatusUpdate {
            provisioning_state: success.provisioning_state.as_deref(),
            external_id: success.external_id.as_deref(),
        };

        match op.kind {
            OperationKind::Delete if !current.status.is_terminal() => {
                resource::transition(&mut tx, &current.id, current.status, update).await?;
                resource::mark_deleted_in(&mut tx, &current.id, &lease.owner, Utc::now()).await?;
            }
            OperationKind::Create | OperationKind::Update
                if current.status.can_transition_to(ResourceStatus::Active) =>
            {
                resource::transition(&mut tx, &current.id, ResourceStatus::Active, update).await?;
            }
            _ => warn!(
                "{:?} of {} succeeded remotely but the resource is {:?}; leaving it",
                op.kind, current.resource_key, current.status
            ),
        }

        let released = operation::release_dependents_in(&mut tx, &op.id).await?;
        tx.commit().await?;

        info!(
            "{:?} of {} done, {} dependent operation(s) released",
            op.kind, target.resource_key, released
        );
        Ok(AttemptOutcome::Succeeded {
            operation_id: op.id.clone(),
            released,
        })
    }

    async fn settle_retry(
        &self,
        op: &Operation,
        lease: &Lease,
        cause: &ProviderError,
    ) -> Result<AttemptOutcome> {
        let reason = cause.to_string();
        let backoff = self.config.retry_backoff(lease.try_count);
        let not_before = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut tx = self.pool.begin().await?;
        operation::release_in(&mut tx, lease, OperationStatus::Pending, Some(&reason), Some(not_before))
            .await?;

        if operation::is_batch_abandoned(&mut tx, &op.batch_id).await? {
            operation::set_status_in(&mut tx, &op.id, OperationStatus::Abandoned, Some(&reason))
                .await?;
            operation::abandon_dependents_in(&mut tx, &op.id).await?;
            tx.commit().await?;

            info!("Batch {} was abandoned; {} will not be retried", op.batch_id, op.id);
            return Ok(AttemptOutcome::Abandoned {
                operation_id: op.id.clone(),
                reason,
            });
        }

        tx.commit().await?;

        warn!(
            "Attempt {}/{} of {} failed transiently, retrying in {:?}: {}",
            lease.try_count, op.max_try_count, op.id, backoff, reason
        );
        Ok(AttemptOutcome::RetryScheduled {
            operation_id: op.id.clone(),
            try_count: lease.try_count,
            reason,
        })
    }

    async fn settle_failure(
        &self,
        op: &Operation,
        lease: &Lease,
        cause: &ProviderError,
    ) -> Result<AttemptOutcome> {
        let reason = if cause.is_transient() {
            format!(
                "giving up after {}/{} tries: {}",
                lease.try_count, op.max_try_count, cause
            )
        } else {
            cause.to_string()
        };

        let mut tx = self.pool.begin().await?;
        operation::release_in(&mut tx, lease, OperationStatus::Failed, Some(&reason), None).await?;
        let abandoned = fail_and_cascade_in(&mut tx, &op.id, &op.resource_id, &reason).await?;
        tx.commit().await?;

        error!(
            "Operation {} failed: {} ({} dependent operation(s) abandoned)",
            op.id,
            reason,
            abandoned.len()
        );
        Ok(AttemptOutcome::Failed {
            operation_id: op.id.clone(),
            reason,
            abandoned,
        })
    }

    async fn abandon_for_terminal_resource(
        &self,
        op: &Operation,
        target: &Resource,
    ) -> Result<AttemptOutcome> {
        let reason = format!("resource {} is {:?}", target.resource_key, target.status);
        let mut tx = self.pool.begin().await?;
        if !operation::set_status_in(&mut tx, &op.id, OperationStatus::Abandoned, Some(&reason))
            .await?
        {
            return Err(OrchestratorError::ConcurrencyConflict(format!(
                "operation {} settled concurrently",
                op.id
            )));
        }
        operation::abandon_dependents_in(&mut tx, &op.id).await?;
        tx.commit().await?;

        warn!("Abandoned {}: {}", op.id, reason);
        Ok(AttemptOutcome::Abandoned {
            operation_id: op.id.clone(),
            reason,
        })
    }

    async fn log_phase(&self, sandbox_id: &str) {
        match phase::get_phase(&self.pool, sandbox_id).await {
            Ok(phase) => info!(sandbox_id, ?phase, "Sandbox phase recomputed"),
            Err(e) => warn!("Could not recompute phase of {}: {}", sandbox_id, e),
        }
    }
}

/// Mark an operation `Failed` (unless already settled as such), its resource
/// `Failed`, and abandon everything downstream of it. Runs inside the
/// caller's transaction.
pub(crate) async fn fail_and_cascade_in(
    conn: &mut SqliteConnection,
    operation_id: &str,
    resource_id: &str,
    reason: &str,
) -> Result<Vec<String>> {
    operation::set_status_in(conn, operation_id, OperationStatus::Failed, Some(reason)).await?;

    if let Some(current) = resource::fetch_by_id(conn, resource_id).await? {
        if !current.status.is_terminal() {
            resource::transition(conn, resource_id, ResourceStatus::Failed, StatusUpdate::default())
                .await?;
        }
    }

    operation::abandon_dependents_in(conn, operation_id).await
}

/// Run `fut` until `deadline`, unless `cancel` fires first.
async fn bounded<T, F>(
    deadline: Instant,
    timeout: std::time::Duration,
    cancel: &mut CancelSignal,
    fut: F,
) -> std::result::Result<T, ProviderError>
where
    F: Future<Output = std::result::Result<T, ProviderError>>,
{
    tokio::select! {
        result = tokio::time::timeout_at(deadline, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        },
        _ = cancelled(cancel) => Err(ProviderError::Cancelled),
    }
}

async fn cancelled(signal: &mut CancelSignal) {
    loop {
        if *signal.borrow_and_update() {
            return;
        }
        if signal.changed().await.is_err() {
            // Sender gone: nobody can cancel any more.
            std::future::pending::<()>().await;
        }
    }
}
