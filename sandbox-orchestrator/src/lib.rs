//! Sandbox resource orchestration
//!
//! This crate tracks the cloud resources that make up a sandbox and the
//! operations that create, update and delete them. Batches of changes are
//! admitted atomically with their dependency edges, workers claim eligible
//! operations under a lease, and the sandbox phase is projected from the
//! resulting log. It is consumed by the sandbox-worker binary but can also
//! be embedded by other entry points.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lease;
pub mod operation;
pub mod orchestrator;
pub mod phase;
pub mod provider;
pub mod resource;
pub mod scheduler;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod timeout;

pub use config::OrchestratorConfig;
pub use engine::{never_cancelled, AttemptOutcome, CancelSignal, ExecutionEngine};
pub use error::{OrchestratorError, Result};
pub use lease::{Lease, LeaseConfig, LeaseSweeper, SweepReport};
pub use operation::{Batch, Operation, OperationKind, OperationLog, OperationStatus};
pub use orchestrator::{ResourceHistory, SandboxOrchestrator};
pub use phase::SandboxPhase;
pub use provider::{CloudProvider, ProviderError, ProviderHandle, RemoteStatus, ResourceDescriptor};
pub use resource::{Resource, ResourceRegistry, ResourceSpec, ResourceStatus, ResourceType};
pub use scheduler::{BatchReceipt, BatchRequest, ChangeRequest, DependencyGraph, DependencyScheduler};
pub use timeout::{TimeoutPolicy, TimeoutRule};
