use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{split_api_version, Gvr, InstallState, LifecycleStatus};

/// A user custom resource managed through a binding.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub cluster_name: String,
    #[serde(default)]
    pub service_binding_id: String,
    #[serde(default)]
    pub resource_id: String,

    /// The custom resource as the user submitted it.
    #[serde(default)]
    pub raw_resource: Value,

    #[serde(default)]
    pub status: LifecycleStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub install_state: InstallState,

    #[serde(default)]
    pub process_time: i64,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,

    // Joined from the owning resource row
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub plural: String,
}

impl Instance {
    /// Build an instance from a raw custom resource, defaulting its namespace.
    ///
    /// Returns `None` when the document lacks `apiVersion`, `kind` or `metadata.name`.
    pub fn from_raw(raw: Value, namespace: &str, cluster_name: &str) -> Option<Self> {
        let api_version = raw.get("apiVersion")?.as_str()?.to_string();
        let kind = raw.get("kind")?.as_str()?.to_string();
        let name = raw.pointer("/metadata/name")?.as_str()?.to_string();
        let namespace = raw
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(namespace)
            .to_string();

        let mut raw = raw;
        if let Some(metadata) = raw.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata.insert("namespace".into(), Value::String(namespace.clone()));
        }

        Some(Self {
            name,
            namespace,
            cluster_name: cluster_name.to_string(),
            raw_resource: raw,
            status: LifecycleStatus::Initializing,
            kind,
            api_version,
            ..Default::default()
        })
    }

    pub fn gvr(&self) -> Gvr {
        let (group, version) = split_api_version(&self.api_version);
        Gvr::new(group, version, self.plural.clone())
    }
}
