//! Infrastructure provisioning seam.
//!
//! Bringing up a project's build namespace (engine, registry, object store,
//! service account, network policy) is plain cluster CRUD and lives with the
//! cluster integration, behind this trait. The lifecycle only needs to know
//! whether provisioning succeeded; implementations must be idempotent
//! create-if-absent and swallow AlreadyExists internally.

use async_trait::async_trait;
use std::fmt::Debug;

#[derive(thiserror::Error, Debug)]
pub enum DeployError {
    #[error("could not provision pipeline infrastructure; {0}")]
    Failed(String),
}

#[async_trait]
pub trait InfraDeployer: Debug + Send + Sync {
    async fn deploy(&self, project_name: &str) -> Result<(), DeployError>;
}

/// Deployer that provisions nothing. Dev mode and tests.
#[derive(Debug, Default)]
pub struct NoopDeployer;

#[async_trait]
impl InfraDeployer for NoopDeployer {
    async fn deploy(&self, _project_name: &str) -> Result<(), DeployError> {
        Ok(())
    }
}
