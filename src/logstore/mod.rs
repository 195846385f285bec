pub mod filesystem;
pub mod memory;

use crate::models::execution::PipelineExecution;
use crate::models::project_id;
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt::Debug;
use strum::{Display, EnumString};

/// Represents different log store failure possibilities.
#[derive(thiserror::Error, Debug)]
pub enum LogStoreError {
    #[error("could not establish connection to log store; {0}")]
    Connection(String),

    #[error("requested log not found")]
    NotFound,

    /// Failed to start due to misconfigured settings, usually from a
    /// misconfigured settings file.
    #[error("could not init log store; {0}")]
    FailedPrecondition(String),

    #[error("unexpected log store error occurred; {0}")]
    Unknown(String),
}

/// Where completed step logs are kept once their execution log object is
/// finished (object storage or equivalent).
#[async_trait]
pub trait LogStore: Debug + Send + Sync {
    async fn put(&self, key: &str, content: Vec<u8>) -> Result<(), LogStoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, LogStoreError>;
    async fn delete(&self, key: &str) -> Result<(), LogStoreError>;
}

/// The storage key for one step's completed log.
pub fn step_log_key(execution: &PipelineExecution, stage: usize, step: usize) -> String {
    format!(
        "{}/{}/{}-{}.log",
        project_id(&execution.spec.project_name),
        execution.meta.name,
        stage,
        step
    )
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Memory,
    Filesystem,
}

pub fn init_log_store(
    backend: &Backend,
    path: &Option<String>,
) -> Result<Box<dyn LogStore>, LogStoreError> {
    match backend {
        Backend::Memory => Ok(Box::new(memory::Store::new())),
        Backend::Filesystem => {
            let Some(path) = path else {
                return Err(LogStoreError::FailedPrecondition(
                    "filesystem log store requires a path".into(),
                ));
            };
            Ok(Box::new(filesystem::Store::new(path)?))
        }
    }
}
