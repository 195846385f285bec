use super::config::{PipelineConfig, StepKind};
use super::pipeline::Pipeline;
use super::{now_rfc3339, ObjectMeta, Finish, State, FINISH_LABEL};
use crate::constraints::substitute_vars;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// What caused an execution to be created.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, JsonSchema,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Cron,
    Webhook,
    #[default]
    User,
}

/// Trigger metadata captured at creation time.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct TriggerContext {
    pub trigger_type: TriggerType,
    pub triggered_by: String,
    pub branch: String,
    pub commit: String,
    pub event: String,
    pub author: String,
    pub message: String,
    pub ref_spec: String,
}

/// One triggered run of a pipeline. The spec is immutable intent; the status is
/// mutated repeatedly by the lifecycle handler and the state syncer.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineExecution {
    pub meta: ObjectMeta,
    pub spec: ExecutionSpec,
    pub status: ExecutionStatus,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionSpec {
    /// `cluster:project` ref of the owning project.
    pub project_name: String,
    /// `namespace:name` ref of the owning pipeline.
    pub pipeline_name: String,
    /// Copy of the pipeline's `next_run` at creation time.
    pub run: u64,
    pub triggered_by: String,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub ref_spec: String,
    /// Full copy of the pipeline configuration this run executes.
    pub config: PipelineConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExecutionStatus {
    pub execution_state: State,
    #[serde(default)]
    pub started: String,
    #[serde(default)]
    pub ended: String,
    #[serde(default)]
    pub commit: String,
    /// Always the same length as `spec.config.stages`; never resized after
    /// creation.
    pub stages: Vec<StageStatus>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StageStatus {
    pub state: State,
    #[serde(default)]
    pub started: String,
    #[serde(default)]
    pub ended: String,
    pub steps: Vec<StepStatus>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepStatus {
    pub state: State,
    #[serde(default)]
    pub started: String,
    #[serde(default)]
    pub ended: String,
}

/// Progress flags tracked independently of the execution state. Together they
/// distinguish "engine not ready yet" from "engine ready but build failed"
/// from "build succeeded".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionKind {
    /// The execution was admitted and the engine job is being arranged.
    Initialized,
    /// The engine accepted the job and is allocating executors.
    Provisioned,
    /// The build outcome is known.
    Built,
}

#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Serialize, Deserialize, JsonSchema,
)]
pub enum ConditionStatus {
    #[default]
    Unknown,
    True,
    False,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Condition {
    pub kind: ConditionKind,
    pub status: ConditionStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub last_transition: String,
}

impl PipelineExecution {
    /// Build a new execution for a trigger. Stage and step statuses are sized
    /// to the config up front and never resized afterwards; anything filtered
    /// out by `when` constraints is born `Skipped`. `${VAR}` references in step
    /// environments and scripts are resolved against the trigger metadata.
    pub fn new(pipeline: &Pipeline, config: PipelineConfig, trigger: TriggerContext) -> Self {
        let run = pipeline.status.next_run;
        let mut meta = ObjectMeta::new(&pipeline.meta.namespace, &format!("{}-{}", pipeline.meta.name, run));
        meta.labels.insert(
            FINISH_LABEL.to_string(),
            Finish::Queued.as_label_value().to_string(),
        );

        let vars = trigger_vars(pipeline, run, &trigger);
        let config = render_config(config, &vars);

        let stages = config
            .stages
            .iter()
            .map(|stage| {
                let stage_applies = stage
                    .when
                    .as_ref()
                    .map_or(true, |when| when.matches(&trigger.branch, &trigger.event));
                let steps: Vec<StepStatus> = stage
                    .steps
                    .iter()
                    .map(|step| {
                        let step_applies = stage_applies
                            && step
                                .when
                                .as_ref()
                                .map_or(true, |when| when.matches(&trigger.branch, &trigger.event));
                        StepStatus {
                            state: if step_applies { State::Waiting } else { State::Skipped },
                            ..Default::default()
                        }
                    })
                    .collect();
                let all_skipped = steps.iter().all(|step| step.state == State::Skipped);
                StageStatus {
                    state: if all_skipped { State::Skipped } else { State::Waiting },
                    started: String::new(),
                    ended: String::new(),
                    steps,
                }
            })
            .collect();

        PipelineExecution {
            meta,
            spec: ExecutionSpec {
                project_name: pipeline.spec.project_name.clone(),
                pipeline_name: super::object_ref(&pipeline.meta),
                run,
                triggered_by: trigger.triggered_by,
                trigger_type: trigger.trigger_type,
                branch: trigger.branch,
                commit: trigger.commit,
                event: trigger.event,
                author: trigger.author,
                message: trigger.message,
                ref_spec: trigger.ref_spec,
                config,
            },
            status: ExecutionStatus {
                execution_state: State::Waiting,
                started: now_rfc3339(),
                stages,
                ..Default::default()
            },
        }
    }

    /// `(namespace, name)` of the owning pipeline.
    pub fn pipeline_ref(&self) -> (String, String) {
        super::parse_ref(&self.spec.pipeline_name)
    }

    pub fn finish(&self) -> Finish {
        self.meta
            .labels
            .get(FINISH_LABEL)
            .map(|value| Finish::from_label_value(value))
            .unwrap_or(Finish::Queued)
    }

    pub fn set_finish(&mut self, finish: Finish) {
        self.meta.labels.insert(
            FINISH_LABEL.to_string(),
            finish.as_label_value().to_string(),
        );
    }

    pub fn step(&self, stage: usize, step: usize) -> Option<&StepStatus> {
        self.status.stages.get(stage)?.steps.get(step)
    }

    pub fn condition(&self, kind: ConditionKind) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|condition| condition.kind == kind)
    }

    pub fn condition_status(&self, kind: ConditionKind) -> Option<ConditionStatus> {
        self.condition(kind).map(|condition| condition.status)
    }

    pub fn condition_is_true(&self, kind: ConditionKind) -> bool {
        self.condition_status(kind) == Some(ConditionStatus::True)
    }

    pub fn any_condition_false(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|condition| condition.status == ConditionStatus::False)
    }

    /// Record the condition with `Unknown` status if it has never been set.
    /// An already present condition is left untouched, which is what makes
    /// admission re-entrant.
    pub fn ensure_condition_unknown(&mut self, kind: ConditionKind) {
        if self.condition(kind).is_none() {
            self.status.conditions.push(Condition {
                kind,
                status: ConditionStatus::Unknown,
                message: String::new(),
                last_transition: now_rfc3339(),
            });
        }
    }

    pub fn set_condition(
        &mut self,
        kind: ConditionKind,
        status: ConditionStatus,
        message: impl Into<String>,
    ) {
        let message = message.into();
        match self
            .status
            .conditions
            .iter_mut()
            .find(|condition| condition.kind == kind)
        {
            Some(condition) => {
                if condition.status != status {
                    condition.last_transition = now_rfc3339();
                }
                condition.status = status;
                condition.message = message;
            }
            None => self.status.conditions.push(Condition {
                kind,
                status,
                message,
                last_transition: now_rfc3339(),
            }),
        }
    }

    /// Update only the message, creating the condition as `Unknown` if absent.
    pub fn set_condition_message(&mut self, kind: ConditionKind, message: impl Into<String>) {
        let message = message.into();
        match self
            .status
            .conditions
            .iter_mut()
            .find(|condition| condition.kind == kind)
        {
            Some(condition) => condition.message = message,
            None => self.status.conditions.push(Condition {
                kind,
                status: ConditionStatus::Unknown,
                message,
                last_transition: now_rfc3339(),
            }),
        }
    }
}

/// Variables injected into step environments and scripts so user config can
/// reference trigger metadata.
fn trigger_vars(
    pipeline: &Pipeline,
    run: u64,
    trigger: &TriggerContext,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "PIPELINE_REPO_URL".to_string(),
            pipeline.spec.repository_url.clone(),
        ),
        ("PIPELINE_RUN".to_string(), run.to_string()),
        ("PIPELINE_GIT_BRANCH".to_string(), trigger.branch.clone()),
        ("PIPELINE_GIT_COMMIT".to_string(), trigger.commit.clone()),
        ("PIPELINE_EVENT".to_string(), trigger.event.clone()),
        (
            "PIPELINE_TRIGGER".to_string(),
            trigger.trigger_type.to_string(),
        ),
    ])
}

fn render_config(mut config: PipelineConfig, vars: &BTreeMap<String, String>) -> PipelineConfig {
    for stage in &mut config.stages {
        for step in &mut stage.steps {
            for value in step.env.values_mut() {
                *value = substitute_vars(value, vars);
            }
            match &mut step.kind {
                StepKind::RunScript(script) => {
                    script.shell_script = substitute_vars(&script.shell_script, vars);
                }
                StepKind::PublishImage(publish) => {
                    publish.tag = substitute_vars(&publish.tag, vars);
                }
                StepKind::SourceCode(_) | StepKind::ApplyYaml(_) => {}
            }
        }
    }
    config
}
