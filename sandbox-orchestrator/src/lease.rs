//! Leases: single-owner execution and crash recovery.
//!
//! A [`Lease`] is handed out by a successful claim and must be presented when
//! the attempt settles. Leases expire; [`LeaseSweeper::sweep`] returns the
//! operations behind expired leases to the queue (or fails them once their
//! tries are used up), so work held by a crashed worker is picked up again.

use crate::engine::fail_and_cascade_in;
use crate::error::Result;
use crate::operation::{self, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Proof that one session holds one operation `InProgress`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub operation_id: String,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    /// Row version right after the claim; settling requires it unchanged.
    pub version: i64,
    /// Try count including this attempt.
    pub try_count: u32,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Added on top of the resolved remote timeout when sizing a lease.
    pub grace_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { grace_secs: 30 }
    }
}

impl LeaseConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Lease length for an attempt bounded by `timeout`.
    pub fn lease_for(&self, timeout: Duration) -> Duration {
        timeout + self.grace()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: u64,
    pub failed: u64,
    pub abandoned: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

#[derive(Clone)]
pub struct LeaseSweeper {
    pool: SqlitePool,
}

impl LeaseSweeper {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Reclaim every lease that expired before `now`. Safe to run repeatedly
    /// and concurrently with workers: a row is only touched if its version is
    /// still the one that was listed.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for op in operation::list_expired_leases(&self.pool, now).await? {
            let mut tx = self.pool.begin().await?;

            if !operation::reclaim_in(&mut tx, &op).await? {
                continue;
            }

            warn!(
                "Lease of {} on operation {} expired, reclaiming",
                op.lease_owner.as_deref().unwrap_or("unknown"),
                op.id
            );

            if operation::is_batch_abandoned(&mut tx, &op.batch_id).await? {
                operation::set_status_in(
                    &mut tx,
                    &op.id,
                    OperationStatus::Abandoned,
                    Some("batch abandoned while the lease was held"),
                )
                .await?;
                operation::abandon_dependents_in(&mut tx, &op.id).await?;
                report.abandoned += 1;
            } else if !op.has_tries_left() {
                let reason = format!(
                    "lease expired on final attempt ({}/{})",
                    op.try_count, op.max_try_count
                );
                fail_and_cascade_in(&mut tx, &op.id, &op.resource_id, &reason).await?;
                report.failed += 1;
            } else {
                report.requeued += 1;
            }

            tx.commit().await?;
        }

        // An attempt that settled as a retry after its batch was abandoned
        // leaves a pending row nobody will claim.
        for op in operation::list_stranded(&self.pool).await? {
            let mut tx = self.pool.begin().await?;
            if operation::set_status_in(
                &mut tx,
                &op.id,
                OperationStatus::Abandoned,
                Some("batch abandoned"),
            )
            .await?
            {
                operation::abandon_dependents_in(&mut tx, &op.id).await?;
                report.abandoned += 1;
            }
            tx.commit().await?;
        }

        if !report.is_empty() {
            info!(
                "Lease sweep: {} requeued, {} failed, {} abandoned",
                report.requeued, report.failed, report.abandoned
            );
        }

        Ok(report)
    }
}
