//! Reconciliation of pipeline executions.
//!
//! The handler runs on every create/update of an execution, delivered
//! at-least-once with no ordering guarantee across objects. It is responsible
//! for setting up infrastructure when executions are admitted, maintaining the
//! per-project execution queue, and tearing an execution down when it is
//! aborted or finished. Every branch is written to be safe under redelivery.

#[cfg(test)]
mod tests;

use crate::deploy::InfraDeployer;
use crate::engine::BuildEngine;
use crate::models::execution::{ConditionKind, ConditionStatus, PipelineExecution};
use crate::models::resources::RoleBinding;
use crate::models::setting::SETTING_EXECUTOR_QUOTA;
use crate::models::{
    infra_namespace, now_rfc3339, object_ref, project_id, Finish, Selector, State, APP_LABEL,
    ENGINE_WORKER_APP, EXECUTION_LABEL, FINISH_LABEL,
};
use crate::repository::{Repository, RepositoryError};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct Lifecycle {
    repository: Arc<dyn Repository>,
    engine: Arc<dyn BuildEngine>,
    deployer: Arc<dyn InfraDeployer>,
}

impl Lifecycle {
    pub fn new(
        repository: Arc<dyn Repository>,
        engine: Arc<dyn BuildEngine>,
        deployer: Arc<dyn InfraDeployer>,
    ) -> Self {
        Lifecycle {
            repository,
            engine,
            deployer,
        }
    }

    /// Handle one delivery for an execution. The handler works on an owned
    /// copy and only writes back when it changed something, so redelivering
    /// the same object settles instead of looping.
    pub async fn reconcile(&self, original: &PipelineExecution) -> Result<()> {
        if original.meta.deletion_timestamp.is_some() {
            return Ok(());
        }
        let mut execution = original.clone();

        if execution.status.execution_state == State::Aborted {
            self.handle_abort(&mut execution).await?;
        }

        if execution.finish() == Finish::Terminal {
            self.persist_if_changed(original, &execution).await?;
            return self.handle_finish(&execution).await;
        }

        // Admission already happened once; its side effects must not repeat.
        if execution.condition(ConditionKind::Initialized).is_some() {
            self.persist_if_changed(original, &execution).await?;
            return Ok(());
        }

        if self.exceeds_quota(&execution).await? {
            execution.status.execution_state = State::Queueing;
            execution.set_finish(Finish::Queued);
            update_pipeline_last_run(self.repository.as_ref(), &execution)
                .await
                .context("could not record last run state on the owning pipeline")?;
            self.persist_if_changed(original, &execution).await?;
            debug!(
                namespace = execution.meta.namespace,
                execution = execution.meta.name,
                "Execution queued; project quota reached"
            );
            return Ok(());
        }
        if execution.status.execution_state == State::Queueing {
            execution.status.execution_state = State::Waiting;
        }

        update_pipeline_last_run(self.repository.as_ref(), &execution)
            .await
            .context("could not record last run state on the owning pipeline")?;
        execution.ensure_condition_unknown(ConditionKind::Initialized);
        execution.set_finish(Finish::Running);

        if let Err(err) = self.deployer.deploy(&execution.spec.project_name).await {
            error!(
                namespace = execution.meta.namespace,
                execution = execution.meta.name,
                error = %err,
                "Could not deploy pipeline infrastructure; failing execution"
            );
            execution.set_finish(Finish::Terminal);
            execution.status.execution_state = State::Failed;
            if execution.status.ended.is_empty() {
                execution.status.ended = now_rfc3339();
            }
            execution.set_condition(
                ConditionKind::Initialized,
                ConditionStatus::False,
                err.to_string(),
            );
            self.persist_if_changed(original, &execution).await?;
            return Ok(());
        }

        self.persist_if_changed(original, &execution).await?;
        self.reconcile_role_bindings(&execution.spec.project_name)
            .await?;
        Ok(())
    }

    /// Stop the engine side of an aborted execution and fold the abort into
    /// its stage/step states. Safe to run repeatedly: the engine's stop is a
    /// no-op when nothing is running and the state rewrites converge.
    async fn handle_abort(&self, execution: &mut PipelineExecution) -> Result<()> {
        if execution.condition_is_true(ConditionKind::Initialized) {
            self.engine
                .stop(execution)
                .await
                .context("could not stop execution on the build engine")?;
            self.engine
                .sync(execution)
                .await
                .context("could not capture final engine state for aborted execution")?;
        }
        execution.set_condition_message(ConditionKind::Built, "aborted by user");
        for stage in &mut execution.status.stages {
            if stage.state == State::Building {
                stage.state = State::Aborted;
            }
            for step in &mut stage.steps {
                if step.state == State::Building {
                    step.state = State::Aborted;
                }
            }
        }

        let (namespace, name) = execution.pipeline_ref();
        match self.repository.get_pipeline(&namespace, &name).await {
            Ok(mut pipeline) => {
                if pipeline.status.last_execution_id == object_ref(&execution.meta)
                    && pipeline.status.last_run_state != Some(execution.status.execution_state)
                {
                    pipeline.status.last_run_state = Some(execution.status.execution_state);
                    self.repository.update_pipeline(&pipeline).await?;
                }
            }
            Err(RepositoryError::NotFound) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Terminal executions get their per-build resources cleaned up, then the
    /// oldest queued execution in the project takes the freed slot.
    async fn handle_finish(&self, execution: &PipelineExecution) -> Result<()> {
        self.cleanup(execution).await?;
        self.promote_oldest_queued(&execution.spec.project_name)
            .await?;
        Ok(())
    }

    async fn cleanup(&self, execution: &PipelineExecution) -> Result<()> {
        self.engine
            .stop(execution)
            .await
            .context("could not stop execution on the build engine during cleanup")?;

        let namespace = infra_namespace(&project_id(&execution.spec.project_name));
        let selector = Selector::new()
            .eq(APP_LABEL, ENGINE_WORKER_APP)
            .eq(EXECUTION_LABEL, &execution.meta.name);
        for pod in self.repository.list_pods(&namespace, &selector).await? {
            match self.repository.delete_pod(&namespace, &pod.meta.name).await {
                Ok(()) | Err(RepositoryError::NotFound) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Promote the longest-waiting queued execution. Ordering is by creation
    /// timestamp with object name as the tie-break, so promotion is
    /// deterministic even for executions created in the same instant.
    async fn promote_oldest_queued(&self, project_name: &str) -> Result<()> {
        let project = project_id(project_name);
        let queued = self
            .repository
            .list_executions(Some(&project), &Selector::new().eq(FINISH_LABEL, ""))
            .await?;

        let Some(mut oldest) = queued.into_iter().min_by(|a, b| {
            a.meta
                .created
                .cmp(&b.meta.created)
                .then_with(|| a.meta.name.cmp(&b.meta.name))
        }) else {
            return Ok(());
        };

        if oldest.status.execution_state == State::Waiting {
            return Ok(());
        }
        oldest.status.execution_state = State::Waiting;
        self.repository.update_execution(&oldest).await?;
        info!(
            namespace = oldest.meta.namespace,
            execution = oldest.meta.name,
            "Promoted queued execution"
        );
        Ok(())
    }

    /// Whether admitting this execution would exceed the project's executor
    /// quota. The running count is recomputed from a fresh list on every call;
    /// the bound is advisory, not atomic, under concurrent creation.
    async fn exceeds_quota(&self, execution: &PipelineExecution) -> Result<bool> {
        let project = project_id(&execution.spec.project_name);
        let setting = match self
            .repository
            .get_setting(&project, SETTING_EXECUTOR_QUOTA)
            .await
        {
            Ok(setting) => setting,
            Err(RepositoryError::NotFound) => return Ok(false),
            Err(err) => return Err(err.into()),
        };

        let quota: i64 = match setting.effective().parse() {
            Ok(quota) => quota,
            Err(_) => return Ok(false),
        };
        if quota <= 0 {
            return Ok(false);
        }

        let running = self
            .repository
            .list_executions(Some(&project), &Selector::new().eq(FINISH_LABEL, "false"))
            .await?;
        Ok(running.len() as i64 >= quota)
    }

    /// Grant the project's build service account access to every namespace in
    /// the project, and revoke it from namespaces that left.
    async fn reconcile_role_bindings(&self, project_name: &str) -> Result<()> {
        let project = project_id(project_name);
        let common_name = infra_namespace(&project);

        let namespaces = self.repository.list_namespaces(&Selector::new()).await?;
        for namespace in namespaces {
            if namespace.project_id().as_deref() == Some(project.as_str()) {
                let binding =
                    RoleBinding::for_project_namespace(&namespace.meta.name, &common_name);
                match self.repository.create_role_binding(&binding).await {
                    Ok(_) | Err(RepositoryError::Exists) => {}
                    Err(err) => {
                        return Err(err).context("could not create pipeline role binding")
                    }
                }
            } else {
                match self
                    .repository
                    .delete_role_binding(&namespace.meta.name, &common_name)
                    .await
                {
                    Ok(()) | Err(RepositoryError::NotFound) => {}
                    Err(err) => {
                        return Err(err).context("could not delete pipeline role binding")
                    }
                }
            }
        }
        Ok(())
    }

    async fn persist_if_changed(
        &self,
        original: &PipelineExecution,
        execution: &PipelineExecution,
    ) -> Result<(), RepositoryError> {
        if execution != original {
            self.repository.update_execution(execution).await?;
        }
        Ok(())
    }
}

/// Run bookkeeping on the owning pipeline. A new execution (its `run` matching
/// the pipeline's `next_run`) advances the counter and becomes the last
/// execution; the guard only matches once, so calling this any number of times
/// with the same execution increments `next_run` at most once. Whenever the
/// execution is the recorded last one, its state is mirrored into
/// `last_run_state`.
pub(crate) async fn update_pipeline_last_run(
    repository: &dyn Repository,
    execution: &PipelineExecution,
) -> Result<(), RepositoryError> {
    let (namespace, name) = execution.pipeline_ref();
    let mut pipeline = repository.get_pipeline(&namespace, &name).await?;

    let execution_ref = object_ref(&execution.meta);
    let mut changed = false;
    if execution.spec.run == pipeline.status.next_run {
        pipeline.status.next_run += 1;
        pipeline.status.last_execution_id = execution_ref.clone();
        pipeline.status.last_started = execution.status.started.clone();
        changed = true;
    }
    if pipeline.status.last_execution_id == execution_ref
        && pipeline.status.last_run_state != Some(execution.status.execution_state)
    {
        pipeline.status.last_run_state = Some(execution.status.execution_state);
        changed = true;
    }
    if changed {
        repository.update_pipeline(&pipeline).await?;
    }
    Ok(())
}
