//! Helpers for tests: an in-memory database and a scriptable provider.

use crate::operation::OperationKind;
use crate::provider::{CloudProvider, ProviderError, ProviderHandle, RemoteStatus, ResourceDescriptor};
use crate::resource::ResourceType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

/// What the provider does with the next submission for a resource key.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedOutcome {
    Succeed,
    /// Report `InProgress` for this many polls, then succeed.
    SucceedAfterPolls(u32),
    FailTransient(String),
    FailTerminal(String),
    /// `submit` itself returns this error.
    RejectSubmit(ProviderError),
    /// Stay `InProgress` forever.
    Hang,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub handle: ProviderHandle,
    pub resource_key: String,
    pub resource_type: ResourceType,
    pub kind: OperationKind,
    pub submitted_at: DateTime<Utc>,
}

struct InFlight {
    resource_key: String,
    outcome: ScriptedOutcome,
    polls: u32,
}

/// Provider whose answers are scripted per resource key. Keys without a
/// script succeed on the first poll.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>,
    in_flight: Mutex<HashMap<ProviderHandle, InFlight>>,
    submissions: Mutex<Vec<Submission>>,
    cancelled: Mutex<Vec<ProviderHandle>>,
    counter: AtomicU64,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue outcomes for successive submissions against `resource_key`.
    pub fn script(
        &self,
        resource_key: &str,
        outcomes: impl IntoIterator<Item = ScriptedOutcome>,
    ) -> &Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(resource_key.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().expect("submissions lock").clone()
    }

    pub fn submissions_for(&self, resource_key: &str) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.resource_key == resource_key)
            .collect()
    }

    pub fn cancelled(&self) -> Vec<ProviderHandle> {
        self.cancelled.lock().expect("cancelled lock").clone()
    }

    fn next_outcome(&self, resource_key: &str) -> ScriptedOutcome {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get_mut(resource_key)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedOutcome::Succeed)
    }
}

#[async_trait]
impl CloudProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn submit(
        &self,
        resource_type: ResourceType,
        kind: OperationKind,
        descriptor: &ResourceDescriptor,
    ) -> Result<ProviderHandle, ProviderError> {
        let outcome = self.next_outcome(&descriptor.resource_key);
        if let ScriptedOutcome::RejectSubmit(e) = outcome {
            return Err(e);
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = ProviderHandle::new(format!("req-{}-{}", descriptor.resource_key, n));

        self.submissions
            .lock()
            .expect("submissions lock")
            .push(Submission {
                handle: handle.clone(),
                resource_key: descriptor.resource_key.clone(),
                resource_type,
                kind,
                submitted_at: Utc::now(),
            });
        self.in_flight.lock().expect("in-flight lock").insert(
            handle.clone(),
            InFlight {
                resource_key: descriptor.resource_key.clone(),
                outcome,
                polls: 0,
            },
        );

        Ok(handle)
    }

    async fn poll_status(&self, handle: &ProviderHandle) -> Result<RemoteStatus, ProviderError> {
        let mut in_flight = self.in_flight.lock().expect("in-flight lock");
        let request = in_flight
            .get_mut(handle)
            .ok_or_else(|| ProviderError::Terminal(format!("unknown handle {}", handle.as_str())))?;
        request.polls += 1;

        let succeeded = || RemoteStatus::Succeeded {
            external_id: Some(format!("/subscriptions/test/{}", request.resource_key)),
            provisioning_state: Some("Succeeded".to_string()),
        };
        let running = || RemoteStatus::InProgress {
            provisioning_state: Some("Running".to_string()),
        };

        let status = match &request.outcome {
            ScriptedOutcome::Succeed => succeeded(),
            ScriptedOutcome::SucceedAfterPolls(n) if request.polls <= *n => running(),
            ScriptedOutcome::SucceedAfterPolls(_) => succeeded(),
            ScriptedOutcome::FailTransient(message) => RemoteStatus::Failed {
                message: message.clone(),
                retryable: true,
            },
            ScriptedOutcome::FailTerminal(message) => RemoteStatus::Failed {
                message: message.clone(),
                retryable: false,
            },
            ScriptedOutcome::Hang | ScriptedOutcome::RejectSubmit(_) => running(),
        };

        Ok(status)
    }

    async fn cancel(&self, handle: &ProviderHandle) -> Result<(), ProviderError> {
        self.cancelled
            .lock()
            .expect("cancelled lock")
            .push(handle.clone());
        Ok(())
    }
}
