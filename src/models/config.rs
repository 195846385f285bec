//! The pipeline configuration embedded into every execution.
//!
//! Executions carry a full copy of the config they were triggered with so that
//! later edits to the pipeline definition never change a run that is already
//! in flight.

use crate::constraints::Constraints;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineConfig {
    pub stages: Vec<Stage>,
}

/// A named phase of the pipeline. Stages run in sequence; the steps inside a
/// stage run in parallel on the build engine.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Stage {
    pub name: String,
    /// Branch/event filters for the whole stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Constraints>,
    pub steps: Vec<Step>,
}

/// The smallest schedulable unit within a stage.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<Constraints>,
    /// Environment handed to the step's container. Values may reference
    /// trigger metadata with `${VAR}` syntax.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// What the step actually does on the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Check the repository out into the workspace.
    SourceCode(SourceCodeConfig),
    /// Run a script inside a user supplied image.
    RunScript(RunScriptConfig),
    /// Build and push a container image.
    PublishImage(PublishImageConfig),
    /// Apply a manifest to the cluster.
    ApplyYaml(ApplyYamlConfig),
}

impl Default for StepKind {
    fn default() -> Self {
        StepKind::RunScript(RunScriptConfig::default())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SourceCodeConfig {
    #[serde(default)]
    pub repository_url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub credential_name: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunScriptConfig {
    pub image: String,
    pub shell_script: String,
    #[serde(default)]
    pub entrypoint: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PublishImageConfig {
    #[serde(default)]
    pub dockerfile_path: String,
    #[serde(default)]
    pub build_context: String,
    pub tag: String,
    /// Push to an external registry instead of the project's internal one.
    #[serde(default)]
    pub push_remote: bool,
    #[serde(default)]
    pub registry: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ApplyYamlConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub content: String,
}

impl PipelineConfig {
    /// The branch the config's checkout step targets, if it has one.
    pub fn source_branch(&self) -> Option<&str> {
        self.stages.iter().flat_map(|stage| &stage.steps).find_map(
            |step| match &step.kind {
                StepKind::SourceCode(config) if !config.branch.is_empty() => {
                    Some(config.branch.as_str())
                }
                _ => None,
            },
        )
    }
}
