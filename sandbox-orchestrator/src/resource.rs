//! Resource registry: the durable record of every managed remote object.
//!
//! Rows are keyed by a stable internal resource key and are never physically
//! removed. Status only moves forward (see [`ResourceStatus::can_transition_to`]);
//! the one exception is corrective re-admission of a `Failed` resource, which
//! only the scheduler performs.

use crate::db::{from_millis, to_millis};
use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ResourceType {
    ResourceGroup,
    StorageAccount,
    VirtualNetwork,
    NetworkSecurityGroup,
    VirtualMachine,
    Bastion,
    PublicIpAddress,
    NetworkInterface,
    Disk,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ResourceGroup => "resource_group",
            Self::StorageAccount => "storage_account",
            Self::VirtualNetwork => "virtual_network",
            Self::NetworkSecurityGroup => "network_security_group",
            Self::VirtualMachine => "virtual_machine",
            Self::Bastion => "bastion",
            Self::PublicIpAddress => "public_ip_address",
            Self::NetworkInterface => "network_interface",
            Self::Disk => "disk",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ResourceStatus {
    Pending,
    Provisioning,
    Active,
    Deleting,
    Deleted,
    Failed,
}

impl ResourceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Deleted | Self::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Provisioning => 1,
            Self::Active => 2,
            Self::Deleting => 3,
            Self::Deleted => 4,
            Self::Failed => 5,
        }
    }

    /// Forward-only along Pending→Provisioning→Active→Deleting→Deleted, or to
    /// `Failed` from any non-terminal state. Staying put is always allowed.
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || next.rank() > self.rank()
    }
}

/// Desired shape of a resource as named in a batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub key: String,
    pub resource_type: ResourceType,
    pub name: String,
    pub region: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Opaque payload handed to the cloud provider untouched.
    #[serde(default)]
    pub descriptor: serde_json::Value,
    #[serde(default = "default_sandbox_controlled")]
    pub sandbox_controlled: bool,
}

fn default_sandbox_controlled() -> bool {
    true
}

impl ResourceSpec {
    pub fn new(
        key: impl Into<String>,
        resource_type: ResourceType,
        name: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            resource_type,
            name: name.into(),
            region: region.into(),
            tags: BTreeMap::new(),
            descriptor: serde_json::Value::Null,
            sandbox_controlled: true,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_descriptor(mut self, descriptor: serde_json::Value) -> Self {
        self.descriptor = descriptor;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_key: String,
    pub external_id: Option<String>,
    pub resource_type: ResourceType,
    pub name: String,
    pub sandbox_id: String,
    pub region: String,
    pub tags: BTreeMap<String, String>,
    pub descriptor: serde_json::Value,
    pub status: ResourceStatus,
    pub provisioning_state: Option<String>,
    pub sandbox_controlled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<String>,
}

impl Resource {
    /// Fresh `Pending` record for a spec owned by `sandbox_id`.
    pub fn new(spec: &ResourceSpec, sandbox_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            resource_key: spec.key.clone(),
            external_id: None,
            resource_type: spec.resource_type,
            name: spec.name.clone(),
            sandbox_id: sandbox_id.to_string(),
            region: spec.region.clone(),
            tags: spec.tags.clone(),
            descriptor: spec.descriptor.clone(),
            status: ResourceStatus::Pending,
            provisioning_state: None,
            sandbox_controlled: spec.sandbox_controlled,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            deleted_by: None,
        }
    }
}

/// Mutable fields applied by the engine when an attempt settles.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatusUpdate<'a> {
    pub provisioning_state: Option<&'a str>,
    pub external_id: Option<&'a str>,
}

#[derive(Clone)]
pub struct ResourceRegistry {
    pool: SqlitePool,
}

impl ResourceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new record (always as `Pending`) or update the mutable fields
    /// (status, provisioning state, external id) of the existing record with
    /// the same resource key. Identical input writes nothing.
    #[instrument(skip(self, resource), fields(resource_key = %resource.resource_key))]
    pub async fn upsert(&self, resource: &Resource) -> Result<Resource> {
        let mut conn = self.pool.acquire().await?;

        let Some(existing) = fetch_by_key(&mut conn, &resource.resource_key).await? else {
            let mut fresh = resource.clone();
            fresh.status = ResourceStatus::Pending;
            insert(&mut conn, &fresh).await?;
            debug!("Registered resource {}", fresh.resource_key);
            return fetch_by_key(&mut conn, &fresh.resource_key)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(fresh.resource_key.clone()));
        };

        let unchanged = existing.status == resource.status
            && existing.provisioning_state == resource.provisioning_state
            && existing.external_id == resource.external_id;
        if unchanged {
            return Ok(existing);
        }

        if !existing.status.can_transition_to(resource.status) {
            return Err(OrchestratorError::InvalidState(format!(
                "resource {} cannot move from {:?} to {:?}",
                existing.resource_key, existing.status, resource.status
            )));
        }

        let result = sqlx::query(
            "UPDATE resources
             SET status = ?, provisioning_state = ?, external_id = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(resource.status)
        .bind(&resource.provisioning_state)
        .bind(&resource.external_id)
        .bind(to_millis(Utc::now()))
        .bind(&existing.id)
        .bind(existing.status)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::ConcurrencyConflict(format!(
                "resource {} changed concurrently",
                existing.resource_key
            )));
        }

        fetch_by_id(&mut conn, &existing.id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(existing.id.clone()))
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Resource> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_id(&mut conn, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    pub async fn get_by_key(&self, resource_key: &str) -> Result<Resource> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_key(&mut conn, resource_key)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(resource_key.to_string()))
    }

    pub async fn list_for_sandbox(&self, sandbox_id: &str) -> Result<Vec<Resource>> {
        let rows = sqlx::query_as::<_, ResourceRow>(
            "SELECT * FROM resources WHERE sandbox_id = ? ORDER BY created_at, rowid",
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Resource::try_from).collect()
    }

    /// Mark a resource deleted on behalf of `actor`.
    pub async fn mark_deleted(
        &self,
        id: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Result<Resource> {
        let mut conn = self.pool.acquire().await?;
        mark_deleted_in(&mut conn, id, actor, at).await?;
        fetch_by_id(&mut conn, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }
}

pub(crate) async fn fetch_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<Resource>> {
    let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Resource::try_from).transpose()
}

pub(crate) async fn fetch_by_key(
    conn: &mut SqliteConnection,
    resource_key: &str,
) -> Result<Option<Resource>> {
    let row = sqlx::query_as::<_, ResourceRow>("SELECT * FROM resources WHERE resource_key = ?")
        .bind(resource_key)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Resource::try_from).transpose()
}

pub(crate) async fn insert(conn: &mut SqliteConnection, resource: &Resource) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO resources (id, resource_key, external_id, resource_type, name, sandbox_id, region,
                               tags, descriptor, status, provisioning_state, sandbox_controlled,
                               created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&resource.id)
    .bind(&resource.resource_key)
    .bind(&resource.external_id)
    .bind(resource.resource_type)
    .bind(&resource.name)
    .bind(&resource.sandbox_id)
    .bind(&resource.region)
    .bind(serde_json::to_string(&resource.tags)?)
    .bind(serde_json::to_string(&resource.descriptor)?)
    .bind(resource.status)
    .bind(&resource.provisioning_state)
    .bind(resource.sandbox_controlled)
    .bind(to_millis(resource.created_at))
    .bind(to_millis(resource.updated_at))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Refresh the desired-state fields of an existing record from a new request.
pub(crate) async fn refresh_desired(
    conn: &mut SqliteConnection,
    id: &str,
    spec: &ResourceSpec,
) -> Result<()> {
    sqlx::query(
        "UPDATE resources SET name = ?, region = ?, tags = ?, descriptor = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&spec.name)
    .bind(&spec.region)
    .bind(serde_json::to_string(&spec.tags)?)
    .bind(serde_json::to_string(&spec.descriptor)?)
    .bind(to_millis(Utc::now()))
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Corrective re-admission: a `Failed` resource goes back to `Pending`.
pub(crate) async fn reset_failed(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query(
        "UPDATE resources SET status = ?, provisioning_state = NULL, updated_at = ?
         WHERE id = ? AND status = ?",
    )
    .bind(ResourceStatus::Pending)
    .bind(to_millis(Utc::now()))
    .bind(id)
    .bind(ResourceStatus::Failed)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Move a resource to `next`, enforcing the forward-only rule.
pub(crate) async fn transition(
    conn: &mut SqliteConnection,
    id: &str,
    next: ResourceStatus,
    update: StatusUpdate<'_>,
) -> Result<()> {
    let current = fetch_by_id(conn, id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

    if !current.status.can_transition_to(next) {
        return Err(OrchestratorError::InvalidState(format!(
            "resource {} cannot move from {:?} to {:?}",
            current.resource_key, current.status, next
        )));
    }

    sqlx::query(
        "UPDATE resources
         SET status = ?,
             provisioning_state = COALESCE(?, provisioning_state),
             external_id = COALESCE(?, external_id),
             updated_at = ?
         WHERE id = ?",
    )
    .bind(next)
    .bind(update.provisioning_state)
    .bind(update.external_id)
    .bind(to_millis(Utc::now()))
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn mark_deleted_in(
    conn: &mut SqliteConnection,
    id: &str,
    actor: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    let current = fetch_by_id(conn, id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

    if current.status.is_terminal() {
        return Err(OrchestratorError::InvalidState(format!(
            "resource {} is already {:?}",
            current.resource_key, current.status
        )));
    }

    sqlx::query(
        "UPDATE resources SET status = ?, deleted_at = ?, deleted_by = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(ResourceStatus::Deleted)
    .bind(to_millis(at))
    .bind(actor)
    .bind(to_millis(Utc::now()))
    .bind(id)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// Internal row type for sqlx
#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: String,
    resource_key: String,
    external_id: Option<String>,
    resource_type: ResourceType,
    name: String,
    sandbox_id: String,
    region: String,
    tags: String,
    descriptor: String,
    status: ResourceStatus,
    provisioning_state: Option<String>,
    sandbox_controlled: bool,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
    deleted_by: Option<String>,
}

impl TryFrom<ResourceRow> for Resource {
    type Error = OrchestratorError;

    fn try_from(row: ResourceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            resource_key: row.resource_key,
            external_id: row.external_id,
            resource_type: row.resource_type,
            name: row.name,
            sandbox_id: row.sandbox_id,
            region: row.region,
            tags: serde_json::from_str(&row.tags)?,
            descriptor: serde_json::from_str(&row.descriptor)?,
            status: row.status,
            provisioning_state: row.provisioning_state,
            sandbox_controlled: row.sandbox_controlled,
            created_at: from_millis(row.created_at),
            updated_at: from_millis(row.updated_at),
            deleted_at: row.deleted_at.map(from_millis),
            deleted_by: row.deleted_by,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_moves_forward_only() {
        use ResourceStatus::*;

        assert!(Pending.can_transition_to(Provisioning));
        assert!(Provisioning.can_transition_to(Active));
        assert!(Active.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(Pending.can_transition_to(Deleting));

        assert!(!Active.can_transition_to(Provisioning));
        assert!(!Deleting.can_transition_to(Active));
    }

    #[test]
    fn failed_reachable_from_any_non_terminal() {
        use ResourceStatus::*;

        for status in [Pending, Provisioning, Active, Deleting] {
            assert!(status.can_transition_to(Failed), "{status:?}");
        }
        assert!(!Deleted.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states_are_sticky() {
        use ResourceStatus::*;

        assert!(!Deleted.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Active));
        assert!(Deleted.can_transition_to(Deleted));
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: ResourceSpec = serde_json::from_value(serde_json::json!({
            "key": "rg-main",
            "resource_type": "resource_group",
            "name": "rg-main",
            "region": "westeurope"
        }))
        .unwrap();

        assert_eq!(spec.resource_type, ResourceType::ResourceGroup);
        assert!(spec.sandbox_controlled);
        assert!(spec.tags.is_empty());
        assert_eq!(spec.descriptor, serde_json::Value::Null);
    }

    fn row(tags: &str, descriptor: &str) -> ResourceRow {
        ResourceRow {
            id: "res-1".to_string(),
            resource_key: "rg-main".to_string(),
            external_id: None,
            resource_type: ResourceType::ResourceGroup,
            name: "rg-main".to_string(),
            sandbox_id: "sbx-1".to_string(),
            region: "westeurope".to_string(),
            tags: tags.to_string(),
            descriptor: descriptor.to_string(),
            status: ResourceStatus::Pending,
            provisioning_state: None,
            sandbox_controlled: true,
            created_at: 0,
            updated_at: 0,
            deleted_at: None,
            deleted_by: None,
        }
    }

    #[test]
    fn row_decodes_stored_json() {
        let resource = Resource::try_from(row(r#"{"env":"dev"}"#, r#"{"sku":"Standard"}"#)).unwrap();

        assert_eq!(resource.tags.get("env").map(String::as_str), Some("dev"));
        assert_eq!(resource.descriptor["sku"], "Standard");
    }

    #[test]
    fn corrupted_json_is_an_error() {
        assert!(matches!(
            Resource::try_from(row("{not json", "null")),
            Err(OrchestratorError::Serialization(_))
        ));
        assert!(matches!(
            Resource::try_from(row("{}", "[unterminated")),
            Err(OrchestratorError::Serialization(_))
        ));
    }
}
