//! Cloud provider abstraction.
//!
//! The orchestrator never talks to a vendor SDK directly. A [`CloudProvider`]
//! accepts a resource type, an operation kind and an opaque
//! [`ResourceDescriptor`], and hands back a [`ProviderHandle`] that can be
//! polled or cancelled.

use crate::operation::OperationKind;
use crate::resource::{Resource, ResourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Everything the provider needs to act on one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub resource_key: String,
    pub external_id: Option<String>,
    pub name: String,
    pub region: String,
    pub tags: BTreeMap<String, String>,
    pub payload: serde_json::Value,
}

impl From<&Resource> for ResourceDescriptor {
    fn from(resource: &Resource) -> Self {
        Self {
            resource_key: resource.resource_key.clone(),
            external_id: resource.external_id.clone(),
            name: resource.name.clone(),
            region: resource.region.clone(),
            tags: resource.tags.clone(),
            payload: resource.descriptor.clone(),
        }
    }
}

/// Provider-issued reference to one in-flight remote request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderHandle(pub String);

impl ProviderHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Remote state reported by a poll.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteStatus {
    InProgress {
        provisioning_state: Option<String>,
    },
    Succeeded {
        external_id: Option<String>,
        provisioning_state: Option<String>,
    },
    Failed {
        message: String,
        /// Whether the vendor considers the failure worth retrying.
        retryable: bool,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Transient provider error: {0}")]
    Transient(String),

    #[error("Throttled by provider: {0}")]
    Throttled(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Attempt cancelled")]
    Cancelled,

    #[error("Terminal provider error: {0}")]
    Terminal(String),
}

impl ProviderError {
    /// Transient failures leave the operation eligible for another attempt.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Terminal(_))
    }
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    /// Short name used in logs (e.g. "azure", "dry-run").
    fn name(&self) -> &'static str;

    /// Start the remote change.
    async fn submit(
        &self,
        resource_type: ResourceType,
        kind: OperationKind,
        descriptor: &ResourceDescriptor,
    ) -> Result<ProviderHandle, ProviderError>;

    async fn poll_status(&self, handle: &ProviderHandle) -> Result<RemoteStatus, ProviderError>;

    /// Best-effort; called when an attempt times out or is cancelled.
    async fn cancel(&self, handle: &ProviderHandle) -> Result<(), ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_terminal_errors_stop_retries() {
        assert!(ProviderError::Transient("503".into()).is_transient());
        assert!(ProviderError::Throttled("429".into()).is_transient());
        assert!(ProviderError::Timeout(Duration::from_secs(60)).is_transient());
        assert!(ProviderError::Cancelled.is_transient());
        assert!(!ProviderError::Terminal("InvalidTemplate".into()).is_transient());
    }
}
