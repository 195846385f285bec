pub mod memory;

use crate::models::execution::PipelineExecution;
use async_trait::async_trait;
use std::fmt::Debug;

/// Represents different build engine failure possibilities.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Failed to communicate with the engine due to network error or other.
    #[error("could not connect to the build engine; {0}")]
    Connection(String),

    /// The job/build requested by name could not be found on the engine.
    #[error("build job not found; {0}")]
    NotFound(String),

    /// The engine rejected the job definition or its credentials.
    #[error("could not prepare the build job; {0}")]
    FailedPrecondition(String),

    /// An unexpected and unknown error has occurred.
    #[error("unexpected build engine error occurred; {0}")]
    Unknown(String),
}

/// The interface between the controllers and the external system that actually
/// executes step containers.
#[async_trait]
pub trait BuildEngine: Debug + Send + Sync {
    /// Whether the engine is ready to accept jobs for this execution's project
    /// (its pod is up and reachable).
    async fn pre_check(&self, execution: &PipelineExecution) -> Result<bool, EngineError>;

    /// Create-or-update the engine job for this execution, install its
    /// credentials and submit the build. Idempotent: resubmitting an already
    /// submitted execution must not start a second build.
    async fn run(&self, execution: &PipelineExecution) -> Result<(), EngineError>;

    /// Stop whatever the engine is doing for this execution. Must succeed when
    /// nothing is running.
    async fn stop(&self, execution: &PipelineExecution) -> Result<(), EngineError>;

    /// Poll the engine and translate its job/stage/step status into the
    /// execution's status, mutating it in place. Returns whether anything
    /// changed so callers can skip needless writes.
    async fn sync(&self, execution: &mut PipelineExecution) -> Result<bool, EngineError>;

    /// The current log text of one step.
    async fn step_log(
        &self,
        execution: &PipelineExecution,
        stage: usize,
        step: usize,
    ) -> Result<String, EngineError>;
}
