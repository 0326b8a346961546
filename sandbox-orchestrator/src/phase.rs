//! Sandbox phase, projected from the operation log and resource registry.
//!
//! Nothing here writes. When several conditions hold at once the precedence
//! is `Failed > Deleting > Initializing > Deleted > Active`.

use crate::error::{OrchestratorError, Result};
use crate::operation::{Operation, OperationKind, OperationLog, OperationStatus};
use crate::resource::{Resource, ResourceRegistry, ResourceStatus};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxPhase {
    Initializing,
    Active,
    Deleting,
    Deleted,
    Failed,
}

/// `operations` must be in creation order. Returns `None` for a sandbox
/// that owns nothing.
pub fn project(operations: &[Operation], resources: &[Resource]) -> Option<SandboxPhase> {
    if operations.is_empty() && resources.is_empty() {
        return None;
    }

    // A failure stops counting once a later batch targets the same resource.
    let superseded = |position: usize| {
        let failed = &operations[position];
        operations[position + 1..]
            .iter()
            .any(|later| later.resource_id == failed.resource_id && later.batch_id != failed.batch_id)
    };

    let live: Vec<&Operation> = operations
        .iter()
        .enumerate()
        .filter(|(i, op)| !(op.status.is_unsuccessful() && superseded(*i)))
        .map(|(_, op)| op)
        .collect();

    if live.iter().any(|op| op.status.is_unsuccessful()) {
        return Some(SandboxPhase::Failed);
    }

    let in_flight = |op: &&&Operation| {
        matches!(
            op.status,
            OperationStatus::Pending | OperationStatus::Blocked | OperationStatus::InProgress
        )
    };

    if live
        .iter()
        .filter(in_flight)
        .any(|op| op.kind == OperationKind::Delete)
    {
        return Some(SandboxPhase::Deleting);
    }

    if live
        .iter()
        .filter(in_flight)
        .any(|op| op.kind != OperationKind::Delete)
    {
        return Some(SandboxPhase::Initializing);
    }

    if !resources.is_empty()
        && resources
            .iter()
            .all(|r| r.status == ResourceStatus::Deleted)
    {
        return Some(SandboxPhase::Deleted);
    }

    Some(SandboxPhase::Active)
}

/// Load and project the phase of one sandbox.
pub async fn get_phase(pool: &SqlitePool, sandbox_id: &str) -> Result<SandboxPhase> {
    let operations = OperationLog::new(pool.clone())
        .list_for_sandbox(sandbox_id)
        .await?;
    let resources = ResourceRegistry::new(pool.clone())
        .list_for_sandbox(sandbox_id)
        .await?;

    project(&operations, &resources)
        .ok_or_else(|| OrchestratorError::NotFound(format!("sandbox {}", sandbox_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{ResourceSpec, ResourceType};
    use chrono::Utc;

    fn resource(key: &str, status: ResourceStatus) -> Resource {
        let spec = ResourceSpec::new(key, ResourceType::VirtualNetwork, key, "westeurope");
        let mut resource = Resource::new(&spec, "sbx-1");
        resource.id = key.to_string();
        resource.status = status;
        resource
    }

    fn op(resource_id: &str, batch: &str, kind: OperationKind, status: OperationStatus) -> Operation {
        let now = Utc::now();
        Operation {
            id: format!("{}-{:?}-{}", resource_id, kind, batch),
            resource_id: resource_id.to_string(),
            sandbox_id: "sbx-1".to_string(),
            batch_id: batch.to_string(),
            kind,
            status,
            try_count: 0,
            max_try_count: 3,
            created_by_session: "api".to_string(),
            executed_by_session: None,
            depends_on_operation_id: None,
            lease_owner: None,
            lease_expires_at: None,
            version: 0,
            provider_handle: None,
            error: None,
            not_before: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    use OperationKind::*;
    use OperationStatus::*;

    #[test]
    fn empty_sandbox_has_no_phase() {
        assert_eq!(project(&[], &[]), None);
    }

    #[test]
    fn creating_is_initializing() {
        let ops = [op("vnet", "b1", Create, Done), op("nsg", "b1", Create, Blocked)];
        let resources = [
            resource("vnet", ResourceStatus::Active),
            resource("nsg", ResourceStatus::Pending),
        ];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Initializing));
    }

    #[test]
    fn all_done_is_active() {
        let ops = [op("vnet", "b1", Create, Done), op("vnet", "b2", Update, Done)];
        let resources = [resource("vnet", ResourceStatus::Active)];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Active));
    }

    #[test]
    fn failure_wins_over_everything() {
        let ops = [
            op("vnet", "b1", Create, Failed),
            op("nsg", "b1", Delete, InProgress),
            op("vm", "b1", Create, Pending),
        ];
        let resources = [
            resource("vnet", ResourceStatus::Failed),
            resource("nsg", ResourceStatus::Deleting),
            resource("vm", ResourceStatus::Pending),
        ];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Failed));
    }

    #[test]
    fn abandoned_counts_as_failure() {
        let ops = [op("vnet", "b1", Create, Done), op("nsg", "b1", Create, Abandoned)];
        let resources = [
            resource("vnet", ResourceStatus::Active),
            resource("nsg", ResourceStatus::Pending),
        ];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Failed));
    }

    #[test]
    fn deleting_beats_initializing() {
        let ops = [op("vnet", "b1", Create, Pending), op("nsg", "b2", Delete, Blocked)];
        let resources = [
            resource("vnet", ResourceStatus::Pending),
            resource("nsg", ResourceStatus::Active),
        ];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Deleting));
    }

    #[test]
    fn everything_deleted() {
        let ops = [
            op("vnet", "b1", Create, Done),
            op("vnet", "b2", Delete, Done),
        ];
        let resources = [resource("vnet", ResourceStatus::Deleted)];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Deleted));
    }

    #[test]
    fn later_batch_supersedes_failure() {
        let ops = [
            op("vnet", "b1", Create, Failed),
            op("vnet", "b2", Create, Done),
        ];
        let resources = [resource("vnet", ResourceStatus::Active)];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Active));
    }

    #[test]
    fn same_batch_does_not_supersede() {
        let ops = [
            op("vnet", "b1", Create, Failed),
            op("vnet", "b1", Update, Abandoned),
        ];
        let resources = [resource("vnet", ResourceStatus::Failed)];

        assert_eq!(project(&ops, &resources), Some(SandboxPhase::Failed));
    }
}
