use super::ObjectMeta;
use anyhow::{bail, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum concurrently running executions per project. A value ≤ 0 disables
/// the quota entirely.
pub const SETTING_EXECUTOR_QUOTA: &str = "executor-quota";

/// Validity duration of the internal registry's TLS certificate.
pub const SETTING_SIGNING_DURATION: &str = "signing-duration";

/// Extra CA bundle handed to checkout steps for self-hosted git servers.
pub const SETTING_GIT_CA_CERTS: &str = "git-ca-certs";

pub const SETTING_EXECUTOR_CPU_REQUEST: &str = "executor-cpu-request";
pub const SETTING_EXECUTOR_CPU_LIMIT: &str = "executor-cpu-limit";
pub const SETTING_EXECUTOR_MEMORY_REQUEST: &str = "executor-memory-request";
pub const SETTING_EXECUTOR_MEMORY_LIMIT: &str = "executor-memory-limit";

/// Fallback used when neither `value` nor `default` is populated on the stored
/// setting, or when no setting object exists at all.
pub fn compiled_default(key: &str) -> &'static str {
    match key {
        SETTING_EXECUTOR_QUOTA => "2",
        SETTING_SIGNING_DURATION => "24h",
        SETTING_EXECUTOR_CPU_REQUEST => "50m",
        SETTING_EXECUTOR_CPU_LIMIT => "500m",
        SETTING_EXECUTOR_MEMORY_REQUEST => "64Mi",
        SETTING_EXECUTOR_MEMORY_LIMIT => "512Mi",
        _ => "",
    }
}

/// A project-scoped key/value knob with an admin supplied default.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PipelineSetting {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub value: String,
}

impl PipelineSetting {
    /// The value in effect: explicit value, then stored default, then the
    /// compiled-in default for the key.
    pub fn effective(&self) -> &str {
        if !self.value.is_empty() {
            &self.value
        } else if !self.default.is_empty() {
            &self.default
        } else {
            compiled_default(&self.meta.name)
        }
    }
}

/// Parse duration strings like `30s`, `10m`, `24h` or `90d`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    let Some(last) = input.chars().last() else {
        bail!("duration is empty");
    };
    let (number, unit_seconds) = match last {
        's' => (&input[..input.len() - 1], 1u64),
        'm' => (&input[..input.len() - 1], 60),
        'h' => (&input[..input.len() - 1], 3600),
        'd' => (&input[..input.len() - 1], 86400),
        _ => bail!("duration '{input}' must end in one of s, m, h, d"),
    };
    let amount: u64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("could not parse duration amount '{number}'"))?;
    Ok(Duration::from_secs(amount * unit_seconds))
}
