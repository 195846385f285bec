//! Shuttles in-progress step logs from the build engine into the streaming
//! log objects, and archives the final text to the log store once a step
//! settles.

use crate::engine::BuildEngine;
use crate::logstore::{step_log_key, LogStore};
use crate::models::log::PipelineExecutionLog;
use crate::models::{parse_ref, Selector, State, LOG_IN_PROGRESS_LABEL};
use crate::repository::{Repository, RepositoryError};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

#[derive(Debug, Clone)]
pub struct ExecutionLogSyncer {
    repository: Arc<dyn Repository>,
    engine: Arc<dyn BuildEngine>,
    log_store: Arc<dyn LogStore>,
    interval: Duration,
}

impl ExecutionLogSyncer {
    pub fn new(
        repository: Arc<dyn Repository>,
        engine: Arc<dyn BuildEngine>,
        log_store: Arc<dyn LogStore>,
        interval: Duration,
    ) -> Self {
        ExecutionLogSyncer {
            repository,
            engine,
            log_store,
            interval,
        }
    }

    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Execution log syncer shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.sync_once().await {
                        error!(error = %e, "Could not list execution logs for sync");
                    }
                }
            }
        }
    }

    pub async fn sync_once(&self) -> Result<()> {
        let logs = self
            .repository
            .list_execution_logs(None, &Selector::new().eq(LOG_IN_PROGRESS_LABEL, "true"))
            .await?;

        for log in logs {
            let namespace = log.meta.namespace.clone();
            let name = log.meta.name.clone();
            if let Err(e) = self.sync_log(log).await {
                error!(
                    namespace = namespace,
                    log = name,
                    error = %e,
                    "Could not sync execution log"
                );
            }
        }
        Ok(())
    }

    async fn sync_log(&self, mut log: PipelineExecutionLog) -> Result<()> {
        let (namespace, name) = parse_ref(&log.spec.execution_name);
        let execution = match self.repository.get_execution(&namespace, &name).await {
            Ok(execution) => execution,
            Err(RepositoryError::NotFound) => {
                // A dangling log object must never spin forever in the
                // in-progress selector.
                log.append_message("Error: the execution this log belongs to no longer exists");
                log.mark_finished();
                self.repository.update_execution_log(&log).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let Some(step) = execution.step(log.spec.stage, log.spec.step) else {
            log.append_message("Error: step reference is out of range");
            log.mark_finished();
            self.repository.update_execution_log(&log).await?;
            return Ok(());
        };
        let step_state = step.state;

        // Nothing to fetch until the engine actually starts the step.
        if step_state == State::Waiting {
            return Ok(());
        }

        match self
            .engine
            .step_log(&execution, log.spec.stage, log.spec.step)
            .await
        {
            Err(e) => {
                log.append_message(&format!("Error: {e}"));
                log.mark_finished();
            }
            Ok(text) => {
                log.message = text;
                if step_state != State::Building {
                    // The step settled: archive the final text, then drop the
                    // object out of the in-progress selector.
                    let key = step_log_key(&execution, log.spec.stage, log.spec.step);
                    if let Err(e) = self
                        .log_store
                        .put(&key, log.message.clone().into_bytes())
                        .await
                    {
                        error!(
                            namespace = log.meta.namespace,
                            log = log.meta.name,
                            error = %e,
                            "Could not archive completed step log"
                        );
                    }
                    log.mark_finished();
                }
            }
        }

        self.repository.update_execution_log(&log).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::logstore::memory::Store;
    use crate::testutil::{harness, sample_execution, sample_pipeline, StubEngine};
    use pretty_assertions::assert_eq;

    struct Setup {
        repository: Arc<crate::repository::memory::MemoryRepository>,
        engine: Arc<StubEngine>,
        log_store: Arc<Store>,
        syncer: ExecutionLogSyncer,
    }

    fn setup() -> Setup {
        let (repository, _bus) = harness();
        let engine = Arc::new(StubEngine::default());
        let log_store = Arc::new(Store::new());
        let syncer = ExecutionLogSyncer::new(
            repository.clone(),
            engine.clone(),
            log_store.clone(),
            Duration::from_secs(10),
        );
        Setup {
            repository,
            engine,
            log_store,
            syncer,
        }
    }

    async fn seed_log(setup: &Setup, step_state: State) -> PipelineExecutionLog {
        let pipeline = setup
            .repository
            .insert_pipeline(&sample_pipeline("p-demo", "web"))
            .unwrap();
        let mut execution = sample_execution(&pipeline);
        execution.status.stages[0].steps[0].state = step_state;
        let execution = setup.repository.create_execution(&execution).await.unwrap();
        setup
            .repository
            .insert_execution_log(&PipelineExecutionLog::new(&execution, 0, 0))
            .unwrap()
    }

    #[tokio::test]
    async fn waiting_steps_are_skipped() {
        let setup = setup();
        let log = seed_log(&setup, State::Waiting).await;

        setup.syncer.sync_once().await.unwrap();

        let stored = setup
            .repository
            .get_execution_log("p-demo", &log.meta.name)
            .await
            .unwrap();
        assert!(stored.message.is_empty());
        assert!(stored.in_progress());
        assert_eq!(stored.meta.resource_version, log.meta.resource_version);
    }

    #[tokio::test]
    async fn building_steps_stream_log_text() {
        let setup = setup();
        let log = seed_log(&setup, State::Building).await;
        *setup.engine.step_log_result.lock().unwrap() = Ok("compiling...\n".to_string());

        setup.syncer.sync_once().await.unwrap();

        let stored = setup
            .repository
            .get_execution_log("p-demo", &log.meta.name)
            .await
            .unwrap();
        assert_eq!(stored.message, "compiling...\n");
        assert!(stored.in_progress(), "a building step keeps streaming");
    }

    #[tokio::test]
    async fn settled_steps_archive_and_finish() {
        let setup = setup();
        let log = seed_log(&setup, State::Success).await;
        *setup.engine.step_log_result.lock().unwrap() = Ok("all tests passed\n".to_string());

        setup.syncer.sync_once().await.unwrap();

        let stored = setup
            .repository
            .get_execution_log("p-demo", &log.meta.name)
            .await
            .unwrap();
        assert_eq!(stored.message, "all tests passed\n");
        assert!(!stored.in_progress());

        let archived = setup.log_store.get("p-demo/web-0/0-0.log").await.unwrap();
        assert_eq!(archived, b"all tests passed\n");

        // Finished logs drop out of the selector entirely.
        let in_progress = setup
            .repository
            .list_execution_logs(None, &Selector::new().eq(LOG_IN_PROGRESS_LABEL, "true"))
            .await
            .unwrap();
        assert!(in_progress.is_empty());
    }

    #[tokio::test]
    async fn fetch_errors_finish_the_log_with_a_note() {
        let setup = setup();
        let log = seed_log(&setup, State::Building).await;
        *setup.engine.step_log_result.lock().unwrap() =
            Err(EngineError::Connection("engine unreachable".into()));

        setup.syncer.sync_once().await.unwrap();

        let stored = setup
            .repository
            .get_execution_log("p-demo", &log.meta.name)
            .await
            .unwrap();
        assert!(stored.message.contains("engine unreachable"));
        assert!(!stored.in_progress());
    }

    #[tokio::test]
    async fn dangling_execution_reference_finishes_the_log() {
        let setup = setup();
        let pipeline = sample_pipeline("p-demo", "web");
        let execution = sample_execution(&pipeline);
        // The log exists but its execution was never stored.
        let log = setup
            .repository
            .insert_execution_log(&PipelineExecutionLog::new(&execution, 0, 0))
            .unwrap();

        setup.syncer.sync_once().await.unwrap();

        let stored = setup
            .repository
            .get_execution_log("p-demo", &log.meta.name)
            .await
            .unwrap();
        assert!(stored.message.contains("no longer exists"));
        assert!(!stored.in_progress());
    }
}
