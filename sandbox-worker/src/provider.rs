//! Provider selection for the worker binary.

use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use sandbox_orchestrator::{
    CloudProvider, OperationKind, ProviderError, ProviderHandle, RemoteStatus, ResourceDescriptor,
    ResourceType,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

pub const AVAILABLE_PROVIDERS: &[&str] = &["dry-run"];

pub fn get_provider(name: &str) -> Result<Arc<dyn CloudProvider>> {
    match name {
        "dry-run" => Ok(Arc::new(DryRunProvider)),
        _ => Err(WorkerError::UnknownProvider(
            name.to_string(),
            AVAILABLE_PROVIDERS.join(", "),
        )),
    }
}

/// Logs every request and reports it finished on the first poll.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunProvider;

#[async_trait]
impl CloudProvider for DryRunProvider {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    async fn submit(
        &self,
        resource_type: ResourceType,
        kind: OperationKind,
        descriptor: &ResourceDescriptor,
    ) -> std::result::Result<ProviderHandle, ProviderError> {
        let handle = ProviderHandle::new(format!("dry-run-{}", Uuid::new_v4()));
        info!(
            "[dry-run] {:?} {} {} in {} ({})",
            kind,
            resource_type,
            descriptor.name,
            descriptor.region,
            handle.as_str()
        );
        Ok(handle)
    }

    async fn poll_status(
        &self,
        handle: &ProviderHandle,
    ) -> std::result::Result<RemoteStatus, ProviderError> {
        Ok(RemoteStatus::Succeeded {
            external_id: Some(format!("/dry-run/{}", handle.as_str())),
            provisioning_state: Some("Succeeded".to_string()),
        })
    }

    async fn cancel(&self, handle: &ProviderHandle) -> std::result::Result<(), ProviderError> {
        info!("[dry-run] cancel {}", handle.as_str());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_provider_dry_run() {
        let provider = get_provider("dry-run").unwrap();
        assert_eq!(provider.name(), "dry-run");
    }

    #[test]
    fn test_get_provider_unknown() {
        let result = get_provider("azure");
        assert!(matches!(result, Err(WorkerError::UnknownProvider(name, _)) if name == "azure"));
    }
}
