//! In-memory repository with the same observable semantics as the cluster
//! API: conditional updates on `resource_version`, exact-match label
//! selectors, and watch events published on execution create/update. Dev mode
//! and tests; the production repository is the cluster integration.

use super::{Repository, RepositoryError};
use crate::events::{EventBus, Kind};
use crate::models::execution::PipelineExecution;
use crate::models::log::PipelineExecutionLog;
use crate::models::pipeline::Pipeline;
use crate::models::resources::{Namespace, Pod, RoleBinding, Secret, Service};
use crate::models::setting::PipelineSetting;
use crate::models::{now_rfc3339, Object, Selector};
use async_trait::async_trait;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct MemoryRepository {
    pipelines: DashMap<String, Pipeline>,
    executions: DashMap<String, PipelineExecution>,
    execution_logs: DashMap<String, PipelineExecutionLog>,
    settings: DashMap<String, PipelineSetting>,
    secrets: DashMap<String, Secret>,
    namespaces: DashMap<String, Namespace>,
    pods: DashMap<String, Pod>,
    role_bindings: DashMap<String, RoleBinding>,
    services: DashMap<String, Service>,
    events: EventBus,
}

fn storage_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn create_in<T: Object + Clone>(map: &DashMap<String, T>, obj: &T) -> Result<T, RepositoryError> {
    let key = storage_key(&obj.meta().namespace, &obj.meta().name);
    if map.contains_key(&key) {
        return Err(RepositoryError::Exists);
    }
    let mut stored = obj.clone();
    stored.meta_mut().resource_version = 1;
    if stored.meta().created.is_empty() {
        stored.meta_mut().created = now_rfc3339();
    }
    map.insert(key, stored.clone());
    Ok(stored)
}

fn get_from<T: Clone>(
    map: &DashMap<String, T>,
    namespace: &str,
    name: &str,
) -> Result<T, RepositoryError> {
    map.get(&storage_key(namespace, name))
        .map(|entry| entry.value().clone())
        .ok_or(RepositoryError::NotFound)
}

fn update_in<T: Object + Clone>(map: &DashMap<String, T>, obj: &T) -> Result<T, RepositoryError> {
    let key = storage_key(&obj.meta().namespace, &obj.meta().name);
    let mut entry = map.get_mut(&key).ok_or(RepositoryError::NotFound)?;
    if entry.meta().resource_version != obj.meta().resource_version {
        return Err(RepositoryError::Conflict);
    }
    let mut stored = obj.clone();
    stored.meta_mut().resource_version += 1;
    *entry = stored.clone();
    Ok(stored)
}

fn delete_from<T>(
    map: &DashMap<String, T>,
    namespace: &str,
    name: &str,
) -> Result<(), RepositoryError> {
    map.remove(&storage_key(namespace, name))
        .map(|_| ())
        .ok_or(RepositoryError::NotFound)
}

fn list_from<T: Object + Clone>(
    map: &DashMap<String, T>,
    namespace: Option<&str>,
    selector: &Selector,
) -> Vec<T> {
    let mut items: Vec<T> = map
        .iter()
        .filter(|entry| namespace.map_or(true, |ns| entry.meta().namespace == ns))
        .filter(|entry| selector.matches(&entry.meta().labels))
        .map(|entry| entry.value().clone())
        .collect();
    items.sort_by(|a, b| {
        storage_key(&a.meta().namespace, &a.meta().name)
            .cmp(&storage_key(&b.meta().namespace, &b.meta().name))
    });
    items
}

impl MemoryRepository {
    pub fn new(events: EventBus) -> Self {
        MemoryRepository {
            events,
            ..Default::default()
        }
    }

    fn publish_execution(&self, execution: &PipelineExecution) {
        self.events.publish(Kind::AppliedExecution {
            namespace: execution.meta.namespace.clone(),
            name: execution.meta.name.clone(),
        });
    }

    // Seeding helpers for objects the core never creates itself (those are
    // owned by the API layer or the cluster).

    pub fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<Pipeline, RepositoryError> {
        create_in(&self.pipelines, pipeline)
    }

    pub fn insert_execution_log(
        &self,
        log: &PipelineExecutionLog,
    ) -> Result<PipelineExecutionLog, RepositoryError> {
        create_in(&self.execution_logs, log)
    }

    pub fn insert_setting(
        &self,
        setting: &PipelineSetting,
    ) -> Result<PipelineSetting, RepositoryError> {
        create_in(&self.settings, setting)
    }

    pub fn insert_secret(&self, secret: &Secret) -> Result<Secret, RepositoryError> {
        create_in(&self.secrets, secret)
    }

    pub fn insert_namespace(&self, namespace: &Namespace) -> Result<Namespace, RepositoryError> {
        create_in(&self.namespaces, namespace)
    }

    pub fn insert_pod(&self, pod: &Pod) -> Result<Pod, RepositoryError> {
        create_in(&self.pods, pod)
    }

    pub fn insert_service(&self, service: &Service) -> Result<Service, RepositoryError> {
        create_in(&self.services, service)
    }

    pub fn role_binding_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .role_bindings
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn get_pipeline(&self, namespace: &str, name: &str) -> Result<Pipeline, RepositoryError> {
        get_from(&self.pipelines, namespace, name)
    }

    async fn update_pipeline(&self, pipeline: &Pipeline) -> Result<Pipeline, RepositoryError> {
        update_in(&self.pipelines, pipeline)
    }

    async fn list_pipelines(&self, selector: &Selector) -> Result<Vec<Pipeline>, RepositoryError> {
        Ok(list_from(&self.pipelines, None, selector))
    }

    async fn create_execution(
        &self,
        execution: &PipelineExecution,
    ) -> Result<PipelineExecution, RepositoryError> {
        let stored = create_in(&self.executions, execution)?;
        self.publish_execution(&stored);
        Ok(stored)
    }

    async fn get_execution(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PipelineExecution, RepositoryError> {
        get_from(&self.executions, namespace, name)
    }

    async fn update_execution(
        &self,
        execution: &PipelineExecution,
    ) -> Result<PipelineExecution, RepositoryError> {
        let stored = update_in(&self.executions, execution)?;
        self.publish_execution(&stored);
        Ok(stored)
    }

    async fn list_executions(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PipelineExecution>, RepositoryError> {
        Ok(list_from(&self.executions, namespace, selector))
    }

    async fn get_execution_log(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PipelineExecutionLog, RepositoryError> {
        get_from(&self.execution_logs, namespace, name)
    }

    async fn update_execution_log(
        &self,
        log: &PipelineExecutionLog,
    ) -> Result<PipelineExecutionLog, RepositoryError> {
        update_in(&self.execution_logs, log)
    }

    async fn list_execution_logs(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<PipelineExecutionLog>, RepositoryError> {
        Ok(list_from(&self.execution_logs, namespace, selector))
    }

    async fn get_setting(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<PipelineSetting, RepositoryError> {
        get_from(&self.settings, namespace, name)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, RepositoryError> {
        get_from(&self.secrets, namespace, name)
    }

    async fn update_secret(&self, secret: &Secret) -> Result<Secret, RepositoryError> {
        update_in(&self.secrets, secret)
    }

    async fn list_namespaces(
        &self,
        selector: &Selector,
    ) -> Result<Vec<Namespace>, RepositoryError> {
        Ok(list_from(&self.namespaces, None, selector))
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Pod>, RepositoryError> {
        Ok(list_from(&self.pods, Some(namespace), selector))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), RepositoryError> {
        delete_from(&self.pods, namespace, name)
    }

    async fn create_role_binding(
        &self,
        role_binding: &RoleBinding,
    ) -> Result<RoleBinding, RepositoryError> {
        create_in(&self.role_bindings, role_binding)
    }

    async fn delete_role_binding(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), RepositoryError> {
        delete_from(&self.role_bindings, namespace, name)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, RepositoryError> {
        get_from(&self.services, namespace, name)
    }
}
