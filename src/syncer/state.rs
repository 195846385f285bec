//! Advances non-terminal executions by talking to the build engine: from
//! admitted-but-unconfirmed, to running on the engine, to terminal.

use crate::engine::BuildEngine;
use crate::lifecycle::update_pipeline_last_run;
use crate::models::execution::{ConditionKind, ConditionStatus, PipelineExecution};
use crate::models::{now_rfc3339, Finish, Selector, State, FINISH_LABEL};
use crate::repository::{Repository, RepositoryError};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

const SETTING_UP_MESSAGE: &str =
    "Setting up the build environment, this may take a few minutes";
const ASSIGNING_JOBS_MESSAGE: &str = "Assigning jobs to build executors";

#[derive(Debug, Clone)]
pub struct ExecutionStateSyncer {
    repository: Arc<dyn Repository>,
    engine: Arc<dyn BuildEngine>,
    interval: Duration,
}

impl ExecutionStateSyncer {
    pub fn new(
        repository: Arc<dyn Repository>,
        engine: Arc<dyn BuildEngine>,
        interval: Duration,
    ) -> Self {
        ExecutionStateSyncer {
            repository,
            engine,
            interval,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Execution state syncer shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!(error = %e, "Could not list executions for state sync");
                    }
                }
            }
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let running = self
            .repository
            .list_executions(None, &Selector::new().eq(FINISH_LABEL, "false"))
            .await?;

        for execution in running {
            let namespace = execution.meta.namespace.clone();
            let name = execution.meta.name.clone();
            if let Err(e) = self.sync_execution(execution).await {
                error!(
                    namespace = namespace,
                    execution = name,
                    error = %e,
                    "Could not sync execution state"
                );
            }
        }
        Ok(())
    }

    async fn sync_execution(&self, execution: PipelineExecution) -> Result<()> {
        match execution.condition_status(ConditionKind::Initialized) {
            // Admitted, but the engine has not confirmed the job yet.
            Some(ConditionStatus::Unknown) => self.start_on_engine(execution).await,
            // The engine owns the job; poll and translate its status.
            Some(ConditionStatus::True) => self.poll_engine(execution).await,
            // Admission failed terminally (or was never recorded): only keep
            // the pipeline's bookkeeping current.
            _ => self.record_last_run(&execution).await,
        }
    }

    async fn start_on_engine(&self, mut execution: PipelineExecution) -> Result<()> {
        match self.engine.pre_check(&execution).await {
            Err(e) => {
                // PreCheck errors are not retried forever; they fail the run.
                execution.status.execution_state = State::Failed;
                execution.set_condition(ConditionKind::Built, ConditionStatus::False, e.to_string());
                self.persist(execution).await
            }
            Ok(false) => {
                let message_missing = execution
                    .condition(ConditionKind::Initialized)
                    .map_or(true, |condition| condition.message.is_empty());
                if message_missing {
                    execution
                        .set_condition_message(ConditionKind::Initialized, SETTING_UP_MESSAGE);
                    self.persist(execution).await
                } else {
                    Ok(())
                }
            }
            Ok(true) => {
                if let Err(e) = self.engine.run(&execution).await {
                    execution.status.execution_state = State::Failed;
                    execution.set_condition(
                        ConditionKind::Provisioned,
                        ConditionStatus::False,
                        e.to_string(),
                    );
                } else {
                    execution.set_condition(ConditionKind::Initialized, ConditionStatus::True, "");
                    execution.set_condition(
                        ConditionKind::Provisioned,
                        ConditionStatus::Unknown,
                        ASSIGNING_JOBS_MESSAGE,
                    );
                }
                self.persist(execution).await
            }
        }
    }

    async fn poll_engine(&self, mut execution: PipelineExecution) -> Result<()> {
        match self.engine.sync(&mut execution).await {
            Err(e) => {
                execution.status.execution_state = State::Failed;
                execution.set_condition(ConditionKind::Built, ConditionStatus::False, e.to_string());
                self.persist(execution).await
            }
            Ok(true) => self.persist(execution).await,
            // Nothing changed; skip the write to avoid version churn.
            Ok(false) => Ok(()),
        }
    }

    /// The single choke point that marks an execution terminal: any condition
    /// gone False, or a terminal execution state, flips the finish label and
    /// stamps the end time before the write goes out.
    async fn persist(&self, mut execution: PipelineExecution) -> Result<()> {
        if execution.any_condition_false() || execution.status.execution_state.is_terminal() {
            execution.set_finish(Finish::Terminal);
            if execution.status.ended.is_empty() {
                execution.status.ended = now_rfc3339();
            }
        }
        self.repository.update_execution(&execution).await?;
        self.record_last_run(&execution).await
    }

    async fn record_last_run(&self, execution: &PipelineExecution) -> Result<()> {
        match update_pipeline_last_run(self.repository.as_ref(), execution).await {
            Ok(()) => Ok(()),
            Err(RepositoryError::NotFound) => {
                warn!(
                    namespace = execution.meta.namespace,
                    execution = execution.meta.name,
                    "Owning pipeline is gone; skipping last run bookkeeping"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
