//! Shared fixtures and programmable doubles for controller tests.

use crate::deploy::{DeployError, InfraDeployer};
use crate::engine::{BuildEngine, EngineError};
use crate::events::EventBus;
use crate::models::config::{PipelineConfig, RunScriptConfig, Stage, Step, StepKind};
use crate::models::execution::{PipelineExecution, TriggerContext, TriggerType};
use crate::models::pipeline::{Pipeline, PipelineSpec};
use crate::repository::memory::MemoryRepository;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub fn sample_config() -> PipelineConfig {
    PipelineConfig {
        stages: vec![Stage {
            name: "test".to_string(),
            when: None,
            steps: vec![Step {
                kind: StepKind::RunScript(RunScriptConfig {
                    image: "alpine:3.19".to_string(),
                    shell_script: "make test".to_string(),
                    entrypoint: String::new(),
                }),
                ..Default::default()
            }],
        }],
    }
}

pub fn sample_pipeline(project: &str, name: &str) -> Pipeline {
    Pipeline::new(
        project,
        name,
        PipelineSpec {
            project_name: format!("c-local:{project}"),
            repository_url: format!("https://example.com/{project}/{name}.git"),
            source_code_type: "static".to_string(),
            ..Default::default()
        },
    )
}

pub fn sample_execution(pipeline: &Pipeline) -> PipelineExecution {
    PipelineExecution::new(
        pipeline,
        sample_config(),
        TriggerContext {
            trigger_type: TriggerType::User,
            triggered_by: "tester".to_string(),
            branch: "main".to_string(),
            event: "push".to_string(),
            ..Default::default()
        },
    )
}

pub fn harness() -> (std::sync::Arc<MemoryRepository>, EventBus) {
    let bus = EventBus::new();
    let repository = std::sync::Arc::new(MemoryRepository::new(bus.clone()));
    (repository, bus)
}

type SyncMutation = Box<dyn Fn(&mut PipelineExecution) + Send>;

/// Build engine double whose behavior is set per test.
pub struct StubEngine {
    pub pre_check_result: Mutex<Result<bool, EngineError>>,
    pub run_result: Mutex<Result<(), EngineError>>,
    pub sync_result: Mutex<Result<bool, EngineError>>,
    /// Mutation applied to the execution whenever `sync` succeeds.
    pub sync_mutation: Mutex<Option<SyncMutation>>,
    pub step_log_result: Mutex<Result<String, EngineError>>,
    pub stop_calls: AtomicUsize,
    pub run_calls: AtomicUsize,
}

impl std::fmt::Debug for StubEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubEngine").finish_non_exhaustive()
    }
}

impl Default for StubEngine {
    fn default() -> Self {
        StubEngine {
            pre_check_result: Mutex::new(Ok(true)),
            run_result: Mutex::new(Ok(())),
            sync_result: Mutex::new(Ok(false)),
            sync_mutation: Mutex::new(None),
            step_log_result: Mutex::new(Ok(String::new())),
            stop_calls: AtomicUsize::new(0),
            run_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BuildEngine for StubEngine {
    async fn pre_check(&self, _execution: &PipelineExecution) -> Result<bool, EngineError> {
        self.pre_check_result.lock().unwrap().clone()
    }

    async fn run(&self, _execution: &PipelineExecution) -> Result<(), EngineError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);
        self.run_result.lock().unwrap().clone()
    }

    async fn stop(&self, _execution: &PipelineExecution) -> Result<(), EngineError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn sync(&self, execution: &mut PipelineExecution) -> Result<bool, EngineError> {
        let result = self.sync_result.lock().unwrap().clone()?;
        if let Some(mutation) = self.sync_mutation.lock().unwrap().as_ref() {
            mutation(execution);
        }
        Ok(result)
    }

    async fn step_log(
        &self,
        _execution: &PipelineExecution,
        _stage: usize,
        _step: usize,
    ) -> Result<String, EngineError> {
        self.step_log_result.lock().unwrap().clone()
    }
}

#[derive(Debug, Default)]
pub struct CountingDeployer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl InfraDeployer for CountingDeployer {
    async fn deploy(&self, _project_name: &str) -> Result<(), DeployError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FailingDeployer;

#[async_trait]
impl InfraDeployer for FailingDeployer {
    async fn deploy(&self, _project_name: &str) -> Result<(), DeployError> {
        Err(DeployError::Failed(
            "secret provisioning rejected by cluster".into(),
        ))
    }
}
