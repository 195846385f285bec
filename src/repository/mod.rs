pub mod memory;

use crate::models::execution::PipelineExecution;
use crate::models::log::PipelineExecutionLog;
use crate::models::pipeline::Pipeline;
use crate::models::resources::{Namespace, Pod, RoleBinding, Secret, Service};
use crate::models::setting::PipelineSetting;
use crate::models::Selector;
use async_trait::async_trait;
use std::fmt::Debug;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("requested object not found")]
    NotFound,

    #[error("object already exists")]
    Exists,

    /// The object changed underneath the writer. Re-read and retry if the
    /// write still applies.
    #[error("object was modified concurrently")]
    Conflict,

    #[error("unexpected repository error occurred; {0}")]
    Unknown(String),
}

/// The cluster-backed store every controller works against. Updates are
/// conditional on the object's `resource_version`; list is by exact-match
/// label selector, optionally scoped to one namespace.
#[async_trait]
pub trait Repository: Debug + Send + Sync {
    // Pipelines
    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline, RepositoryError>;
    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<Pipeline, RepositoryError>;
    async fn list_pipelines(&self, selector: &Selector) -> Result<Vec<Pipeline>, RepositoryError>;

    // Pipeline executions
    async fn create_execution(
        &self,
        execution: &PipelineExecution,
    ) -> Result<PipelineExecution, RepositoryError>;
    async fn get_execution(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PipelineExecution, RepositoryError>;
    async fn update_execution(
        &self,
        execution: &PipelineExecution,
    ) -> Result<PipelineExecution, RepositoryError>;
    async fn list_executions(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PipelineExecution>, RepositoryError>;

    // Execution logs
    async fn get_execution_log(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PipelineExecutionLog, RepositoryError>;
    async fn update_execution_log(
        &self,
        log: &PipelineExecutionLog,
    ) -> Result<PipelineExecutionLog, RepositoryError>;
    async fn list_execution_logs(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PipelineExecutionLog>, RepositoryError>;

    // Settings
    async fn get_setting(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PipelineSetting, RepositoryError>;

    // Secrets
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, RepositoryError>;
    async fn update_secret(&self, secret: &Secret) -> Result<Secret, RepositoryError>;

    // Namespaces
    async fn list_namespaces(&self, selector: &Selector) -> Result<Vec<Namespace>, RepositoryError>;

    // Pods
    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Pod>, RepositoryError>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), RepositoryError>;

    // Role bindings
    async fn create_role_binding(
        &self,
        role_binding: &RoleBinding,
    ) -> Result<RoleBinding, RepositoryError>;
    async fn delete_role_binding(&self, namespace: &str, name: &str)
        -> Result<(), RepositoryError>;

    // Services
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, RepositoryError>;
}
