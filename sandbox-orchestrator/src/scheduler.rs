//! Batch admission.
//!
//! A batch is validated as a whole (duplicates, conflicting resource types,
//! dependency cycles) before anything touches the database, then written in
//! a single transaction in dependency order so prerequisites always exist
//! before the operations that point at them.

use crate::error::{OrchestratorError, Result};
use crate::operation::{self, Batch, Operation, OperationKind, OperationStatus};
use crate::resource::{self, Resource, ResourceSpec, ResourceStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use tracing::{info, instrument};
use uuid::Uuid;

/// "Wait until `resource_key` has completed `kind`."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub resource_key: String,
    pub kind: OperationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub resource: ResourceSpec,
    pub kind: OperationKind,
    #[serde(default)]
    pub depends_on: Option<DependencyRef>,
}

impl ChangeRequest {
    pub fn new(resource: ResourceSpec, kind: OperationKind) -> Self {
        Self {
            resource,
            kind,
            depends_on: None,
        }
    }

    pub fn create(resource: ResourceSpec) -> Self {
        Self::new(resource, OperationKind::Create)
    }

    pub fn update(resource: ResourceSpec) -> Self {
        Self::new(resource, OperationKind::Update)
    }

    pub fn delete(resource: ResourceSpec) -> Self {
        Self::new(resource, OperationKind::Delete)
    }

    pub fn after(mut self, resource_key: impl Into<String>, kind: OperationKind) -> Self {
        self.depends_on = Some(DependencyRef {
            resource_key: resource_key.into(),
            kind,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub sandbox_id: String,
    /// Session of the actor issuing the request.
    pub session_id: String,
    #[serde(default)]
    pub max_try_count: Option<u32>,
    pub changes: Vec<ChangeRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReceipt {
    pub batch_id: String,
    /// Created operations in request order.
    pub operations: Vec<Operation>,
}

impl BatchReceipt {
    pub fn operation_ids(&self) -> Vec<&str> {
        self.operations.iter().map(|op| op.id.as_str()).collect()
    }
}

/// In-batch dependency edges between changes, by request index.
#[derive(Debug)]
pub struct DependencyGraph {
    prerequisite: Vec<Option<usize>>,
}

impl DependencyGraph {
    /// Validate the shape of a batch and link in-batch dependencies.
    /// Dependencies on changes outside the batch are left unlinked.
    pub fn build(changes: &[ChangeRequest]) -> Result<Self> {
        let mut index: HashMap<(&str, OperationKind), usize> = HashMap::new();
        let mut types = HashMap::new();

        for (i, change) in changes.iter().enumerate() {
            let key = change.resource.key.as_str();
            if index.insert((key, change.kind), i).is_some() {
                return Err(OrchestratorError::BatchValidation(format!(
                    "{:?} of {} requested more than once",
                    change.kind, key
                )));
            }
            if let Some(previous) = types.insert(key, change.resource.resource_type) {
                if previous != change.resource.resource_type {
                    return Err(OrchestratorError::BatchValidation(format!(
                        "{} is named as both {} and {}",
                        key, previous, change.resource.resource_type
                    )));
                }
            }
        }

        let prerequisite = changes
            .iter()
            .map(|change| {
                change
                    .depends_on
                    .as_ref()
                    .and_then(|dep| index.get(&(dep.resource_key.as_str(), dep.kind)).copied())
            })
            .collect();

        Ok(Self { prerequisite })
    }

    pub fn prerequisite_of(&self, node: usize) -> Option<usize> {
        self.prerequisite.get(node).copied().flatten()
    }

    /// Prerequisites before dependents. Any node left over sits on a cycle.
    pub fn topological_order(&self) -> std::result::Result<Vec<usize>, Vec<usize>> {
        let n = self.prerequisite.len();
        let mut waiting_on = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (node, prerequisite) in self.prerequisite.iter().enumerate() {
            if let Some(p) = prerequisite {
                waiting_on[node] += 1;
                dependents[*p].push(node);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| waiting_on[i] == 0).collect();
        let mut order = Vec::with_capacity(n);

        while let Some(node) = ready.pop_front() {
            order.push(node);
            for &dependent in &dependents[node] {
                waiting_on[dependent] -= 1;
                if waiting_on[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }

        if order.len() == n {
            Ok(order)
        } else {
            Err((0..n).filter(|&i| waiting_on[i] > 0).collect())
        }
    }
}

#[derive(Clone)]
pub struct DependencyScheduler {
    pool: SqlitePool,
    default_max_try_count: u32,
}

impl DependencyScheduler {
    pub fn new(pool: SqlitePool, default_max_try_count: u32) -> Self {
        Self {
            pool,
            default_max_try_count,
        }
    }

    /// Admit a batch: everything is persisted, or nothing is.
    #[instrument(skip(self, request), fields(sandbox_id = %request.sandbox_id, session = %request.session_id))]
    pub async fn submit(&self, request: BatchRequest) -> Result<BatchReceipt> {
        if request.changes.is_empty() {
            return Err(OrchestratorError::BatchValidation(
                "batch contains no changes".to_string(),
            ));
        }

        let max_try_count = request.max_try_count.unwrap_or(self.default_max_try_count);
        if max_try_count == 0 {
            return Err(OrchestratorError::BatchValidation(
                "max try count must be at least 1".to_string(),
            ));
        }

        let graph = DependencyGraph::build(&request.changes)?;
        let order = graph.topological_order().map_err(|cycle| {
            let keys: Vec<String> = cycle
                .iter()
                .map(|&i| {
                    let change = &request.changes[i];
                    format!("{:?} {}", change.kind, change.resource.key)
                })
                .collect();
            OrchestratorError::BatchValidation(format!(
                "dependency cycle between: {}",
                keys.join(", ")
            ))
        })?;

        let now = Utc::now();
        let batch = Batch {
            id: Uuid::new_v4().to_string(),
            sandbox_id: request.sandbox_id.clone(),
            created_by_session: request.session_id.clone(),
            created_at: now,
            abandoned_at: None,
            abandoned_by: None,
        };

        let mut tx = self.pool.begin().await?;
        operation::insert_batch(&mut tx, &batch).await?;

        let mut created: Vec<Option<Operation>> = vec![None; request.changes.len()];

        for idx in order {
            let change = &request.changes[idx];
            let target = admit_resource(&mut tx, change, &request.sandbox_id).await?;

            let (status, depends_on, error) = match (&change.depends_on, graph.prerequisite_of(idx)) {
                (None, _) => (OperationStatus::Pending, None, None),
                (Some(_), Some(p)) => {
                    // Topological order guarantees the prerequisite exists.
                    let prerequisite = created[p].as_ref().ok_or_else(|| {
                        OrchestratorError::InvalidState("prerequisite not admitted".to_string())
                    })?;
                    dependency_state(prerequisite)
                }
                (Some(dep), None) => {
                    let existing = match resource::fetch_by_key(&mut tx, &dep.resource_key).await? {
                        Some(r) => operation::latest_for(&mut tx, &r.id, dep.kind).await?,
                        None => None,
                    };
                    match existing {
                        Some(prerequisite) => dependency_state(&prerequisite),
                        None => (
                            OperationStatus::Abandoned,
                            None,
                            Some(format!(
                                "prerequisite {:?} of {} does not exist",
                                dep.kind, dep.resource_key
                            )),
                        ),
                    }
                }
            };

            let op = Operation {
                id: Uuid::new_v4().to_string(),
                resource_id: target.id.clone(),
                sandbox_id: request.sandbox_id.clone(),
                batch_id: batch.id.clone(),
                kind: change.kind,
                status,
                try_count: 0,
                max_try_count,
                created_by_session: request.session_id.clone(),
                executed_by_session: None,
                depends_on_operation_id: depends_on,
                lease_owner: None,
                lease_expires_at: None,
                version: 0,
                provider_handle: None,
                error,
                not_before: None,
                created_at: now,
                updated_at: now,
                completed_at: status.is_terminal().then_some(now),
            };
            operation::insert(&mut tx, &op).await?;
            created[idx] = Some(op);
        }

        tx.commit().await?;

        let operations: Vec<Operation> = created.into_iter().flatten().collect();
        info!(
            "Admitted batch {} with {} operations ({} abandoned at admission)",
            batch.id,
            operations.len(),
            operations
                .iter()
                .filter(|op| op.status == OperationStatus::Abandoned)
                .count()
        );

        Ok(BatchReceipt {
            batch_id: batch.id,
            operations,
        })
    }
}

/// Status, dependency link and error for an operation waiting on `prerequisite`.
fn dependency_state(prerequisite: &Operation) -> (OperationStatus, Option<String>, Option<String>) {
    let link = Some(prerequisite.id.clone());
    match prerequisite.status {
        OperationStatus::Done => (OperationStatus::Pending, link, None),
        status if status.is_unsuccessful() => (
            OperationStatus::Abandoned,
            link,
            Some(format!(
                "prerequisite operation {} is {:?}",
                prerequisite.id, status
            )),
        ),
        _ => (OperationStatus::Blocked, link, None),
    }
}

/// Find or create the resource a change targets.
async fn admit_resource(
    conn: &mut sqlx::SqliteConnection,
    change: &ChangeRequest,
    sandbox_id: &str,
) -> Result<Resource> {
    let spec = &change.resource;

    let Some(existing) = resource::fetch_by_key(conn, &spec.key).await? else {
        let fresh = Resource::new(spec, sandbox_id);
        resource::insert(conn, &fresh).await?;
        return Ok(fresh);
    };

    if existing.sandbox_id != sandbox_id {
        return Err(OrchestratorError::BatchValidation(format!(
            "{} belongs to sandbox {}",
            spec.key, existing.sandbox_id
        )));
    }
    if existing.resource_type != spec.resource_type {
        return Err(OrchestratorError::BatchValidation(format!(
            "{} is a {}, not a {}",
            spec.key, existing.resource_type, spec.resource_type
        )));
    }
    if existing.status == ResourceStatus::Deleted {
        return Err(OrchestratorError::BatchValidation(format!(
            "{} has been deleted and cannot be reused",
            spec.key
        )));
    }
    if existing.status == ResourceStatus::Failed {
        resource::reset_failed(conn, &existing.id).await?;
    }
    if change.kind != OperationKind::Delete {
        resource::refresh_desired(conn, &existing.id, spec).await?;
    }

    Ok(existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceType;

    fn rg(key: &str) -> ResourceSpec {
        ResourceSpec::new(key, ResourceType::ResourceGroup, key, "westeurope")
    }

    fn sa(key: &str) -> ResourceSpec {
        ResourceSpec::new(key, ResourceType::StorageAccount, key, "westeurope")
    }

    #[test]
    fn orders_prerequisites_first() {
        let changes = vec![
            ChangeRequest::create(sa("sa")).after("rg", OperationKind::Create),
            ChangeRequest::create(rg("rg")),
        ];

        let graph = DependencyGraph::build(&changes).unwrap();

        assert_eq!(graph.prerequisite_of(0), Some(1));
        assert_eq!(graph.prerequisite_of(1), None);
        assert_eq!(graph.topological_order().unwrap(), vec![1, 0]);
    }

    #[test]
    fn detects_cycles() {
        let changes = vec![
            ChangeRequest::create(rg("a")).after("c", OperationKind::Create),
            ChangeRequest::create(rg("b")).after("a", OperationKind::Create),
            ChangeRequest::create(rg("c")).after("b", OperationKind::Create),
            ChangeRequest::create(rg("free")),
        ];

        let graph = DependencyGraph::build(&changes).unwrap();
        let cycle = graph.topological_order().unwrap_err();

        assert_eq!(cycle, vec![0, 1, 2]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let changes = vec![ChangeRequest::create(rg("a")).after("a", OperationKind::Create)];

        let graph = DependencyGraph::build(&changes).unwrap();

        assert!(graph.topological_order().is_err());
    }

    #[test]
    fn dependency_on_other_kind_of_same_resource_is_fine() {
        let changes = vec![
            ChangeRequest::update(rg("a")).after("a", OperationKind::Create),
            ChangeRequest::create(rg("a")),
        ];

        let graph = DependencyGraph::build(&changes).unwrap();

        assert_eq!(graph.topological_order().unwrap(), vec![1, 0]);
    }

    #[test]
    fn rejects_duplicate_changes() {
        let changes = vec![ChangeRequest::create(rg("a")), ChangeRequest::create(rg("a"))];

        let err = DependencyGraph::build(&changes).unwrap_err();

        assert!(matches!(err, OrchestratorError::BatchValidation(_)));
    }

    #[test]
    fn rejects_conflicting_types_for_one_key() {
        let changes = vec![ChangeRequest::create(rg("a")), ChangeRequest::update(sa("a"))];

        let err = DependencyGraph::build(&changes).unwrap_err();

        assert!(matches!(err, OrchestratorError::BatchValidation(_)));
    }

    #[test]
    fn dependencies_outside_the_batch_stay_unlinked() {
        let changes = vec![ChangeRequest::create(sa("sa")).after("rg-existing", OperationKind::Create)];

        let graph = DependencyGraph::build(&changes).unwrap();

        assert_eq!(graph.prerequisite_of(0), None);
        assert_eq!(graph.topological_order().unwrap(), vec![0]);
    }
}
