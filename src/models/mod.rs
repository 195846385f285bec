pub mod config;
pub mod execution;
pub mod log;
pub mod pipeline;
pub mod resources;
pub mod setting;

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

/// Label marking how far along its lifecycle an execution is. The label is the only
/// cheap query mechanism the cluster gives us, so its three values double as a
/// status index: `""` = queued, `"false"` = actively running, `"true"` = terminal.
pub const FINISH_LABEL: &str = "pipeline.conveyor.dev/finish";

/// Label set on pipelines that carry a cron trigger expression.
pub const CRON_LABEL: &str = "pipeline.conveyor.dev/cron";

/// Label selecting execution log objects that are still streaming.
pub const LOG_IN_PROGRESS_LABEL: &str = "pipeline.conveyor.dev/log-in-progress";

/// Label tying a build-engine worker pod back to its execution.
pub const EXECUTION_LABEL: &str = "pipeline.conveyor.dev/execution";

/// Label marking the per-project namespaces that hold pipeline infrastructure.
pub const INFRA_NAMESPACE_LABEL: &str = "pipeline.conveyor.dev/infra";

/// Annotation tying a user namespace to the project that owns it. The value is a
/// `cluster:project` ref.
pub const PROJECT_ID_ANNOTATION: &str = "field.conveyor.dev/projectId";

pub const APP_LABEL: &str = "app";
pub const ENGINE_WORKER_APP: &str = "build-engine";
pub const REGISTRY_APP: &str = "registry";

/// The current moment as an RFC3339 string. All persisted timestamps use this
/// fixed-width format so string ordering is chronological ordering.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The state of an execution, stage or step.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Display,
    EnumString,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum State {
    /// Admitted but not yet picked up by the build engine.
    #[default]
    Waiting,
    /// The build engine is actively executing it.
    Building,
    Success,
    Failed,
    /// Filtered out by trigger constraints; never handed to the engine.
    Skipped,
    Aborted,
    /// Held back by the per-project concurrency quota.
    Queueing,
    Pending,
    Denied,
}

impl State {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            State::Success | State::Failed | State::Skipped | State::Aborted | State::Denied
        )
    }
}

/// Typed view over the values of [`FINISH_LABEL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    /// Created (or demoted) but not allowed to run yet.
    Queued,
    /// Actively running and counted against the project quota.
    Running,
    /// Reached a terminal state; the slot it held is free.
    Terminal,
}

impl Finish {
    pub fn as_label_value(&self) -> &'static str {
        match self {
            Finish::Queued => "",
            Finish::Running => "false",
            Finish::Terminal => "true",
        }
    }

    pub fn from_label_value(value: &str) -> Self {
        match value {
            "true" => Finish::Terminal,
            "false" => Finish::Running,
            _ => Finish::Queued,
        }
    }
}

/// Metadata common to every stored resource.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// RFC3339 creation timestamp, set by the repository on create if empty.
    #[serde(default)]
    pub created: String,
    /// Monotonically increasing version used for optimistic concurrency. A write
    /// whose version does not match the stored object is rejected.
    #[serde(default)]
    pub resource_version: u64,
    /// Set when the object is being torn down; handlers no-op on such objects.
    #[serde(default)]
    pub deletion_timestamp: Option<String>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        ObjectMeta {
            namespace: namespace.to_string(),
            name: name.to_string(),
            created: now_rfc3339(),
            ..Default::default()
        }
    }
}

/// Accessors shared by every stored resource kind.
pub trait Object {
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_object {
    ($($type:ty),+ $(,)?) => {
        $(impl Object for $type {
            fn meta(&self) -> &ObjectMeta {
                &self.meta
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.meta
            }
        })+
    };
}

impl_object!(
    execution::PipelineExecution,
    log::PipelineExecutionLog,
    pipeline::Pipeline,
    resources::Namespace,
    resources::Pod,
    resources::RoleBinding,
    resources::Secret,
    resources::Service,
    setting::PipelineSetting,
);

/// An exact-match label selector. A requirement with an empty value matches
/// objects where the key is present with an empty value; it never matches
/// objects missing the key entirely.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<(String, String)>,
}

impl Selector {
    pub fn new() -> Self {
        Selector::default()
    }

    pub fn eq(mut self, key: &str, value: &str) -> Self {
        self.requirements.push((key.to_string(), value.to_string()));
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements
            .iter()
            .all(|(key, value)| labels.get(key).map(String::as_str) == Some(value.as_str()))
    }
}

/// Parse a `namespace:name` ref. A ref without a separator is treated as a bare
/// name with no namespace.
pub fn parse_ref(reference: &str) -> (String, String) {
    match reference.split_once(':') {
        Some((namespace, name)) => (namespace.to_string(), name.to_string()),
        None => (String::new(), reference.to_string()),
    }
}

/// The `namespace:name` ref of an object.
pub fn object_ref(meta: &ObjectMeta) -> String {
    format!("{}:{}", meta.namespace, meta.name)
}

/// The project half of a `cluster:project` project name.
pub fn project_id(project_name: &str) -> String {
    parse_ref(project_name).1
}

/// The namespace holding a project's pipeline infrastructure (build engine,
/// registry, object store).
pub fn infra_namespace(project_id: &str) -> String {
    format!("{project_id}-pipeline")
}
