use super::execution::PipelineExecution;
use super::{object_ref, ObjectMeta, LOG_IN_PROGRESS_LABEL};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Streaming log buffer for one step of one execution. These objects only
/// exist while someone is watching a step build; once the step reaches a
/// terminal state the content moves to the log store and the object drops out
/// of the in-progress selector.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineExecutionLog {
    pub meta: ObjectMeta,
    pub spec: ExecutionLogSpec,
    /// The step's log text as of the last sync.
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionLogSpec {
    /// `cluster:project` ref of the owning project.
    pub project_name: String,
    /// `namespace:name` ref of the owning execution.
    pub execution_name: String,
    pub stage: usize,
    pub step: usize,
}

impl PipelineExecutionLog {
    pub fn new(execution: &PipelineExecution, stage: usize, step: usize) -> Self {
        let mut meta = ObjectMeta::new(
            &execution.meta.namespace,
            &format!("{}-{}-{}", execution.meta.name, stage, step),
        );
        meta.labels
            .insert(LOG_IN_PROGRESS_LABEL.to_string(), "true".to_string());
        PipelineExecutionLog {
            meta,
            spec: ExecutionLogSpec {
                project_name: execution.spec.project_name.clone(),
                execution_name: object_ref(&execution.meta),
                stage,
                step,
            },
            message: String::new(),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.meta.labels.get(LOG_IN_PROGRESS_LABEL).map(String::as_str) == Some("true")
    }

    pub fn mark_finished(&mut self) {
        self.meta
            .labels
            .insert(LOG_IN_PROGRESS_LABEL.to_string(), "false".to_string());
    }

    pub fn append_message(&mut self, text: &str) {
        if !self.message.is_empty() && !self.message.ends_with('\n') {
            self.message.push('\n');
        }
        self.message.push_str(text);
    }
}
