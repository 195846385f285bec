//! Minimal mirrors of the cluster-owned resources the controllers touch.
//! Provisioning these is the infra deployer's job; the core only reads them
//! and performs targeted deletes.

use super::{parse_ref, ObjectMeta, PROJECT_ID_ANNOTATION};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Namespace {
    pub meta: ObjectMeta,
}

impl Namespace {
    /// The project this namespace is annotated into, if any.
    pub fn project_id(&self) -> Option<String> {
        let annotation = self.meta.annotations.get(PROJECT_ID_ANNOTATION)?;
        let (_, project) = parse_ref(annotation);
        if project.is_empty() {
            None
        } else {
            Some(project)
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Secret {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub phase: String,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoleBinding {
    pub meta: ObjectMeta,
    /// `namespace:name` ref of the bound service account.
    pub service_account: String,
    pub role: String,
}

impl RoleBinding {
    /// The binding granting the project's build service account edit rights in
    /// one of the project's namespaces. Name and service account both derive
    /// from the project's infra namespace so reconciliation can find them again.
    pub fn for_project_namespace(namespace: &str, common_name: &str) -> Self {
        RoleBinding {
            meta: ObjectMeta::new(namespace, common_name),
            service_account: format!("{common_name}:pipeline"),
            role: "edit".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Service {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub cluster_ip: String,
    #[serde(default)]
    pub ports: Vec<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_project_id_parses_the_annotation() {
        let mut namespace = Namespace {
            meta: ObjectMeta::new("", "web-prod"),
        };
        assert_eq!(namespace.project_id(), None);

        namespace.meta.annotations.insert(
            PROJECT_ID_ANNOTATION.to_string(),
            "c-local:p-demo".to_string(),
        );
        assert_eq!(namespace.project_id(), Some("p-demo".to_string()));
    }
}
