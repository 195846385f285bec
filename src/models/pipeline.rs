use super::{ObjectMeta, State, CRON_LABEL};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A declarative pipeline definition owned by a project. The definition itself
/// lives in the source repository; this object carries trigger wiring and
/// run bookkeeping.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pipeline {
    pub meta: ObjectMeta,
    pub spec: PipelineSpec,
    pub status: PipelineStatus,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineSpec {
    /// `cluster:project` ref of the owning project.
    pub project_name: String,
    pub repository_url: String,
    /// Which source-code provider serves this repository, e.g. `github`.
    pub source_code_type: String,
    #[serde(default)]
    pub source_code_credential_name: String,
    #[serde(default)]
    pub trigger_webhook_push: bool,
    #[serde(default)]
    pub trigger_webhook_pr: bool,
    #[serde(default)]
    pub trigger_webhook_tag: bool,
    /// Standard 5-field cron expression; empty disables the cron trigger.
    #[serde(default)]
    pub trigger_cron_expression: String,
    /// IANA timezone name. Empty or `Local` means the controller's own zone.
    #[serde(default)]
    pub trigger_cron_timezone: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineStatus {
    /// Sequence number the next execution will be created with. Incremented by
    /// exactly one each time an execution carrying the current value is first
    /// processed.
    #[serde(default)]
    pub next_run: u64,
    /// RFC3339 timestamp of the next cron fire, or empty when not yet computed.
    #[serde(default)]
    pub next_start: String,
    /// `namespace:name` ref of the most recently created execution.
    #[serde(default)]
    pub last_execution_id: String,
    /// Mirror of the last execution's state, kept current by the controllers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_state: Option<State>,
    #[serde(default)]
    pub last_started: String,
}

impl Pipeline {
    pub fn new(namespace: &str, name: &str, spec: PipelineSpec) -> Self {
        let mut meta = ObjectMeta::new(namespace, name);
        if !spec.trigger_cron_expression.is_empty() {
            meta.labels
                .insert(CRON_LABEL.to_string(), "true".to_string());
        }
        Pipeline {
            meta,
            spec,
            status: PipelineStatus::default(),
        }
    }

    pub fn has_cron_trigger(&self) -> bool {
        !self.spec.trigger_cron_expression.is_empty()
    }
}
