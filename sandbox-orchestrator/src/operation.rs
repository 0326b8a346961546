//! Operation log: the append-mostly record of every attempted state change.
//!
//! All mutation funnels through a small set of primitives. `claim` is a
//! version-checked conditional update that only succeeds for an eligible
//! `Pending` row; the `*_in` helpers run inside a caller-owned transaction so
//! the engine, scheduler and sweeper can settle an attempt atomically with the
//! matching resource change.

use crate::db::{from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use crate::lease::Lease;
use crate::provider::ProviderHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Blocked,
    InProgress,
    Done,
    Failed,
    Abandoned,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Abandoned)
    }

    /// Failed outright, or never ran because something upstream failed.
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, Self::Failed | Self::Abandoned)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub resource_id: String,
    pub sandbox_id: String,
    pub batch_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub try_count: u32,
    pub max_try_count: u32,
    pub created_by_session: String,
    pub executed_by_session: Option<String>,
    pub depends_on_operation_id: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub provider_handle: Option<String>,
    pub error: Option<String>,
    /// Set after a transient failure; claims are refused until then.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn has_tries_left(&self) -> bool {
        self.try_count < self.max_try_count
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub sandbox_id: String,
    pub created_by_session: String,
    pub created_at: DateTime<Utc>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub abandoned_by: Option<String>,
}

// Eligibility shared by dispatch listing and the claim itself.
const ELIGIBLE_PREDICATE: &str = "
    operations.status = ?
    AND operations.try_count < operations.max_try_count
    AND (operations.not_before IS NULL OR operations.not_before <= ?)
    AND (operations.depends_on_operation_id IS NULL OR EXISTS (
        SELECT 1 FROM operations dep
        WHERE dep.id = operations.depends_on_operation_id AND dep.status = ?))
    AND NOT EXISTS (
        SELECT 1 FROM batches b
        WHERE b.id = operations.batch_id AND b.abandoned_at IS NOT NULL)";

#[derive(Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<Operation> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Batch> {
        let row = sqlx::query_as::<_, BatchRow>("SELECT * FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(batch_id.to_string()))?;

        Ok(row.into())
    }

    pub async fn list_for_batch(&self, batch_id: &str) -> Result<Vec<Operation>> {
        self.list_where("batch_id", batch_id).await
    }

    pub async fn list_for_resource(&self, resource_id: &str) -> Result<Vec<Operation>> {
        self.list_where("resource_id", resource_id).await
    }

    pub async fn list_for_sandbox(&self, sandbox_id: &str) -> Result<Vec<Operation>> {
        self.list_where("sandbox_id", sandbox_id).await
    }

    async fn list_where(&self, column: &str, value: &str) -> Result<Vec<Operation>> {
        let query = format!(
            "SELECT * FROM operations WHERE {} = ? ORDER BY created_at, rowid",
            column
        );

        let rows = sqlx::query_as::<_, OperationRow>(&query)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Operation::from).collect())
    }

    /// Operations that a worker may claim right now, oldest first.
    pub async fn list_eligible(&self, limit: usize) -> Result<Vec<Operation>> {
        let query = format!(
            "SELECT * FROM operations WHERE {} ORDER BY created_at, rowid LIMIT ?",
            ELIGIBLE_PREDICATE
        );

        let rows = sqlx::query_as::<_, OperationRow>(&query)
            .bind(OperationStatus::Pending)
            .bind(to_millis(Utc::now()))
            .bind(OperationStatus::Done)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Operation::from).collect())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM operations")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Claim a single operation for `session` without touching its resource.
    pub async fn claim(&self, id: &str, session: &str, lease_for: Duration) -> Result<Lease> {
        let mut conn = self.pool.acquire().await?;
        let current = fetch(&mut conn, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        claim_in(&mut conn, &current, session, lease_for).await
    }

    /// Persist the provider handle of the running attempt.
    pub async fn record_submission(&self, lease: &Lease, handle: &ProviderHandle) -> Result<()> {
        let result = sqlx::query(
            "UPDATE operations SET provider_handle = ?, updated_at = ?
             WHERE id = ? AND status = ? AND lease_owner = ? AND version = ?",
        )
        .bind(handle.as_str())
        .bind(to_millis(Utc::now()))
        .bind(&lease.operation_id)
        .bind(OperationStatus::InProgress)
        .bind(&lease.owner)
        .bind(lease.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::LeaseExpired(lease.operation_id.clone()));
        }
        Ok(())
    }

    /// Abandon every not-yet-started operation of a batch (and everything
    /// downstream of them). Operations already running become `Abandoned`
    /// when their attempt settles with a transient failure.
    #[instrument(skip(self))]
    pub async fn abandon_batch(&self, batch_id: &str, actor: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE batches SET abandoned_at = ?, abandoned_by = ?
             WHERE id = ? AND abandoned_at IS NULL",
        )
        .bind(to_millis(now))
        .bind(actor)
        .bind(batch_id)
        .execute(&mut *tx)
        .await?;

        if marked.rows_affected() == 0 {
            let exists: Option<(String,)> = sqlx::query_as("SELECT id FROM batches WHERE id = ?")
                .bind(batch_id)
                .fetch_optional(&mut *tx)
                .await?;
            return match exists {
                Some(_) => Err(OrchestratorError::InvalidState(format!(
                    "batch {} is already abandoned",
                    batch_id
                ))),
                None => Err(OrchestratorError::NotFound(batch_id.to_string())),
            };
        }

        let waiting: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM operations WHERE batch_id = ? AND status IN (?, ?)
             ORDER BY created_at, rowid",
        )
        .bind(batch_id)
        .bind(OperationStatus::Pending)
        .bind(OperationStatus::Blocked)
        .fetch_all(&mut *tx)
        .await?;

        let reason = format!("batch abandoned by {}", actor);
        let mut abandoned = Vec::new();
        for (id,) in waiting {
            if set_status_in(&mut tx, &id, OperationStatus::Abandoned, Some(&reason)).await? {
                abandoned.push(id.clone());
                abandoned.extend(abandon_dependents_in(&mut tx, &id).await?);
            }
        }

        tx.commit().await?;

        info!(
            "Abandoned batch {}: {} operations will not run",
            batch_id,
            abandoned.len()
        );
        Ok(abandoned)
    }
}

pub(crate) async fn fetch(conn: &mut SqliteConnection, id: &str) -> Result<Option<Operation>> {
    let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Operation::from))
}

pub(crate) async fn insert_batch(conn: &mut SqliteConnection, batch: &Batch) -> Result<()> {
    sqlx::query(
        "INSERT INTO batches (id, sandbox_id, created_by_session, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(&batch.id)
    .bind(&batch.sandbox_id)
    .bind(&batch.created_by_session)
    .bind(to_millis(batch.created_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn insert(conn: &mut SqliteConnection, op: &Operation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO operations (id, resource_id, sandbox_id, batch_id, kind, status, try_count,
                                max_try_count, created_by_session, depends_on_operation_id,
                                version, error, created_at, updated_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&op.id)
    .bind(&op.resource_id)
    .bind(&op.sandbox_id)
    .bind(&op.batch_id)
    .bind(op.kind)
    .bind(op.status)
    .bind(op.try_count as i64)
    .bind(op.max_try_count as i64)
    .bind(&op.created_by_session)
    .bind(&op.depends_on_operation_id)
    .bind(op.version)
    .bind(&op.error)
    .bind(to_millis(op.created_at))
    .bind(to_millis(op.updated_at))
    .bind(op.completed_at.map(to_millis))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Most recent operation of `kind` against a resource, if any.
pub(crate) async fn latest_for(
    conn: &mut SqliteConnection,
    resource_id: &str,
    kind: OperationKind,
) -> Result<Option<Operation>> {
    let row = sqlx::query_as::<_, OperationRow>(
        "SELECT * FROM operations WHERE resource_id = ? AND kind = ?
         ORDER BY created_at DESC, rowid DESC LIMIT 1",
    )
    .bind(resource_id)
    .bind(kind)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(Operation::from))
}

pub(crate) async fn is_batch_abandoned(conn: &mut SqliteConnection, batch_id: &str) -> Result<bool> {
    let row: Option<(Option<i64>,)> =
        sqlx::query_as("SELECT abandoned_at FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&mut *conn)
            .await?;

    Ok(matches!(row, Some((Some(_),))))
}

/// Compare-and-swap claim: succeeds only if the row still has the version the
/// caller read, is `Pending` with tries left and no retry delay outstanding,
/// its dependency is `Done` and its batch was not abandoned.
pub(crate) async fn claim_in(
    conn: &mut SqliteConnection,
    current: &Operation,
    session: &str,
    lease_for: Duration,
) -> Result<Lease> {
    match current.status {
        OperationStatus::Pending => {}
        OperationStatus::InProgress => {
            return Err(OrchestratorError::ConcurrencyConflict(format!(
                "operation {} is already held by {}",
                current.id,
                current.lease_owner.as_deref().unwrap_or("another session")
            )));
        }
        status => {
            return Err(OrchestratorError::InvalidState(format!(
                "operation {} is {:?}, only pending operations can be claimed",
                current.id, status
            )));
        }
    }

    let now = Utc::now();
    let lease_ms = i64::try_from(lease_for.as_millis()).unwrap_or(i64::MAX);
    let expires_at = to_millis(now).saturating_add(lease_ms);

    let query = format!(
        "UPDATE operations
         SET status = ?, try_count = try_count + 1, executed_by_session = ?, lease_owner = ?,
             lease_expires_at = ?, version = version + 1, updated_at = ?
         WHERE id = ? AND version = ? AND {}",
        ELIGIBLE_PREDICATE
    );

    let result = sqlx::query(&query)
        .bind(OperationStatus::InProgress)
        .bind(session)
        .bind(session)
        .bind(expires_at)
        .bind(to_millis(now))
        .bind(&current.id)
        .bind(current.version)
        .bind(OperationStatus::Pending)
        .bind(to_millis(now))
        .bind(OperationStatus::Done)
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::ConcurrencyConflict(format!(
            "operation {} was not claimable at version {}",
            current.id, current.version
        )));
    }

    debug!(
        "Session {} claimed operation {} (try {}/{})",
        session,
        current.id,
        current.try_count + 1,
        current.max_try_count
    );

    Ok(Lease {
        operation_id: current.id.clone(),
        owner: session.to_string(),
        expires_at: from_millis(expires_at),
        version: current.version + 1,
        try_count: current.try_count + 1,
    })
}

/// Settle the attempt held by `lease`. `not_before` only matters when the
/// operation goes back to `Pending`. Fails with `LeaseExpired` when the lease
/// has been reclaimed in the meantime.
pub(crate) async fn release_in(
    conn: &mut SqliteConnection,
    lease: &Lease,
    status: OperationStatus,
    error: Option<&str>,
    not_before: Option<DateTime<Utc>>,
) -> Result<()> {
    let now = to_millis(Utc::now());
    let completed_at = status.is_terminal().then_some(now);

    let result = sqlx::query(
        "UPDATE operations
         SET status = ?, error = ?, lease_owner = NULL, lease_expires_at = NULL,
             not_before = ?, version = version + 1, updated_at = ?,
             completed_at = COALESCE(?, completed_at)
         WHERE id = ? AND status = ? AND lease_owner = ? AND version = ?",
    )
    .bind(status)
    .bind(error)
    .bind(not_before.map(to_millis))
    .bind(now)
    .bind(completed_at)
    .bind(&lease.operation_id)
    .bind(OperationStatus::InProgress)
    .bind(&lease.owner)
    .bind(lease.version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(OrchestratorError::LeaseExpired(format!(
            "lease of {} on operation {} is no longer held",
            lease.owner, lease.operation_id
        )));
    }
    Ok(())
}

/// Unconditional status change for a non-terminal operation. Returns false
/// when the operation had already reached a terminal state.
pub(crate) async fn set_status_in(
    conn: &mut SqliteConnection,
    id: &str,
    status: OperationStatus,
    error: Option<&str>,
) -> Result<bool> {
    let now = to_millis(Utc::now());
    let completed_at = status.is_terminal().then_some(now);

    let result = sqlx::query(
        "UPDATE operations
         SET status = ?, error = COALESCE(?, error), lease_owner = NULL, lease_expires_at = NULL,
             version = version + 1, updated_at = ?, completed_at = COALESCE(?, completed_at)
         WHERE id = ? AND status NOT IN (?, ?, ?)",
    )
    .bind(status)
    .bind(error)
    .bind(now)
    .bind(completed_at)
    .bind(id)
    .bind(OperationStatus::Done)
    .bind(OperationStatus::Failed)
    .bind(OperationStatus::Abandoned)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Blocked operations waiting on `id` become eligible.
pub(crate) async fn release_dependents_in(conn: &mut SqliteConnection, id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE operations SET status = ?, version = version + 1, updated_at = ?
         WHERE depends_on_operation_id = ? AND status = ?",
    )
    .bind(OperationStatus::Pending)
    .bind(to_millis(Utc::now()))
    .bind(id)
    .bind(OperationStatus::Blocked)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Walk the dependency edges downstream of `root` and abandon every operation
/// that has not started. Returns the abandoned ids in traversal order.
pub(crate) async fn abandon_dependents_in(
    conn: &mut SqliteConnection,
    root: &str,
) -> Result<Vec<String>> {
    let mut abandoned = Vec::new();
    let mut frontier = vec![root.to_string()];

    while let Some(parent) = frontier.pop() {
        let children: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM operations WHERE depends_on_operation_id = ? AND status IN (?, ?)
             ORDER BY created_at, rowid",
        )
        .bind(&parent)
        .bind(OperationStatus::Pending)
        .bind(OperationStatus::Blocked)
        .fetch_all(&mut *conn)
        .await?;

        let reason = format!("prerequisite operation {} did not succeed", parent);
        for (child,) in children {
            if set_status_in(conn, &child, OperationStatus::Abandoned, Some(&reason)).await? {
                frontier.push(child.clone());
                abandoned.push(child);
            }
        }
    }

    Ok(abandoned)
}

/// In-progress operations whose lease ran out before `cutoff`.
pub(crate) async fn list_expired_leases(
    pool: &SqlitePool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Operation>> {
    let rows = sqlx::query_as::<_, OperationRow>(
        "SELECT * FROM operations WHERE status = ? AND lease_expires_at < ?
         ORDER BY lease_expires_at",
    )
    .bind(OperationStatus::InProgress)
    .bind(to_millis(cutoff))
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Operation::from).collect())
}

/// Pending operations stranded in an abandoned batch.
pub(crate) async fn list_stranded(pool: &SqlitePool) -> Result<Vec<Operation>> {
    let rows = sqlx::query_as::<_, OperationRow>(
        "SELECT operations.* FROM operations
         JOIN batches b ON b.id = operations.batch_id
         WHERE b.abandoned_at IS NOT NULL AND operations.status IN (?, ?)",
    )
    .bind(OperationStatus::Pending)
    .bind(OperationStatus::Blocked)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(Operation::from).collect())
}

/// Take an expired lease back, but only if nobody touched the row since it
/// was listed.
pub(crate) async fn reclaim_in(conn: &mut SqliteConnection, op: &Operation) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE operations
         SET status = ?, lease_owner = NULL, lease_expires_at = NULL, version = version + 1,
             error = ?, updated_at = ?
         WHERE id = ? AND status = ? AND version = ?",
    )
    .bind(OperationStatus::Pending)
    .bind("lease expired before the attempt settled")
    .bind(to_millis(Utc::now()))
    .bind(&op.id)
    .bind(OperationStatus::InProgress)
    .bind(op.version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    resource_id: String,
    sandbox_id: String,
    batch_id: String,
    kind: OperationKind,
    status: OperationStatus,
    try_count: i64,
    max_try_count: i64,
    created_by_session: String,
    executed_by_session: Option<String>,
    depends_on_operation_id: Option<String>,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    version: i64,
    provider_handle: Option<String>,
    error: Option<String>,
    not_before: Option<i64>,
    created_at: i64,
    updated_at: i64,
    completed_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct BatchRow {
    id: String,
    sandbox_id: String,
    created_by_session: String,
    created_at: i64,
    abandoned_at: Option<i64>,
    abandoned_by: Option<String>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            resource_id: row.resource_id,
            sandbox_id: row.sandbox_id,
            batch_id: row.batch_id,
            kind: row.kind,
            status: row.status,
            try_count: u32::try_from(row.try_count).unwrap_or(0),
            max_try_count: u32::try_from(row.max_try_count).unwrap_or(0),
            created_by_session: row.created_by_session,
            executed_by_session: row.executed_by_session,
            depends_on_operation_id: row.depends_on_operation_id,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at.map(from_millis),
            version: row.version,
            provider_handle: row.provider_handle,
            error: row.error,
            not_before: row.not_before.map(from_millis),
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            completed_at: row.completed_at.map(from_millis),
        }
    }
}

impl From<BatchRow> for Batch {
    fn from(row: BatchRow) -> Self {
        Self {
            id: row.id,
            sandbox_id: row.sandbox_id,
            created_by_session: row.created_by_session,
            created_at: from_millis(row.created_at),
            abandoned_at: row.abandoned_at.map(from_millis),
            abandoned_by: row.abandoned_by,
        }
    }
}
