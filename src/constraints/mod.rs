//! Trigger constraint evaluation and `${VAR}` substitution.
//!
//! Stages and steps can restrict themselves to particular branches or events;
//! anything filtered out is created in the `Skipped` state instead of being
//! handed to the build engine.

use lazy_regex::regex;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single include/exclude filter. Patterns are literal except for `*`, which
/// spans any run of characters. Exclusions win over inclusions; an empty
/// include list admits everything not excluded.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Constraint {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl Constraint {
    pub fn matches(&self, value: &str) -> bool {
        if self
            .exclude
            .iter()
            .any(|pattern| wildcard_match(pattern, value))
        {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include
            .iter()
            .any(|pattern| wildcard_match(pattern, value))
    }
}

/// The filters a stage or step can carry.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<Constraint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Constraint>,
}

impl Constraints {
    pub fn matches(&self, branch: &str, event: &str) -> bool {
        if let Some(constraint) = &self.branch {
            if !constraint.matches(branch) {
                return false;
            }
        }
        if let Some(constraint) = &self.event {
            if !constraint.matches(event) {
                return false;
            }
        }
        true
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }
    let anchored = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
    match Regex::new(&anchored) {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

/// Replace `${VAR}` occurrences with values from `vars`. References to unknown
/// variables are left untouched so user text never silently disappears.
pub fn substitute_vars(input: &str, vars: &BTreeMap<String, String>) -> String {
    let re = regex!(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}");
    re.replace_all(input, |captures: &regex::Captures| {
        let name = &captures[1];
        match vars.get(name) {
            Some(value) => value.clone(),
            None => captures[0].to_string(),
        }
    })
    .into_owned()
}
