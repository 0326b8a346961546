use crate::config::OrchestratorConfig;
use crate::engine::ExecutionEngine;
use crate::error::Result;
use crate::lease::LeaseSweeper;
use crate::operation::{Operation, OperationLog};
use crate::phase::{self, SandboxPhase};
use crate::provider::CloudProvider;
use crate::resource::{Resource, ResourceRegistry};
use crate::scheduler::{BatchReceipt, BatchRequest, DependencyScheduler};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;

/// A resource together with every operation ever recorded against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHistory {
    pub resource: Resource,
    pub operations: Vec<Operation>,
}

/// Entry point for callers: batch submission plus the read-only query API.
#[derive(Clone)]
pub struct SandboxOrchestrator {
    pool: SqlitePool,
    config: OrchestratorConfig,
    registry: ResourceRegistry,
    log: OperationLog,
    scheduler: DependencyScheduler,
}

impl SandboxOrchestrator {
    pub fn new(pool: SqlitePool, config: OrchestratorConfig) -> Self {
        Self {
            registry: ResourceRegistry::new(pool.clone()),
            log: OperationLog::new(pool.clone()),
            scheduler: DependencyScheduler::new(pool.clone(), config.default_max_try_count),
            pool,
            config,
        }
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn operations(&self) -> &OperationLog {
        &self.log
    }

    /// Engine executing against `provider` with this orchestrator's config.
    pub fn engine(&self, provider: Arc<dyn CloudProvider>) -> ExecutionEngine {
        ExecutionEngine::new(self.pool.clone(), provider, self.config.clone())
    }

    pub fn sweeper(&self) -> LeaseSweeper {
        LeaseSweeper::new(self.pool.clone())
    }

    pub async fn submit_batch(&self, request: BatchRequest) -> Result<BatchReceipt> {
        self.scheduler.submit(request).await
    }

    pub async fn abandon_batch(&self, batch_id: &str, actor: &str) -> Result<Vec<String>> {
        self.log.abandon_batch(batch_id, actor).await
    }

    pub async fn get_operations_for_batch(&self, batch_id: &str) -> Result<Vec<Operation>> {
        // Surface NotFound for unknown batches rather than an empty list.
        self.log.get_batch(batch_id).await?;
        self.log.list_for_batch(batch_id).await
    }

    pub async fn get_phase(&self, sandbox_id: &str) -> Result<SandboxPhase> {
        phase::get_phase(&self.pool, sandbox_id).await
    }

    pub async fn get_resource_history(&self, resource_key: &str) -> Result<ResourceHistory> {
        let resource = self.registry.get_by_key(resource_key).await?;
        let operations = self.log.list_for_resource(&resource.id).await?;

        Ok(ResourceHistory {
            resource,
            operations,
        })
    }
}
