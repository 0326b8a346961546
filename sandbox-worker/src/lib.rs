pub mod config;
pub mod error;
pub mod provider;
pub mod sweeper;
pub mod worker;

pub use config::WorkerConfig;
pub use error::{Result, WorkerError};
pub use provider::{get_provider, DryRunProvider};
pub use sweeper::start_sweeper_task;
pub use worker::{run_worker, start_worker_pool, Shutdown};
