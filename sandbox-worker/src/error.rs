use sandbox_orchestrator::OrchestratorError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkerError>;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Unknown provider '{0}' (available: {1})")]
    UnknownProvider(String, String),

    #[error("Invalid timeout policy in {path}: {source}")]
    TimeoutPolicy {
        path: PathBuf,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("Invalid value for {name}: {value}")]
    InvalidSetting { name: &'static str, value: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
