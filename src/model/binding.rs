use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    resources::{CrdShape, Permission, ServiceResources, Workloads},
    Result,
};

use super::LifecycleStatus;

/// One installed service in one cluster.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBinding {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub status: LifecycleStatus,
    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub workloads: Workloads,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub crd: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_plugin: Option<Value>,

    /// Deadline of the step in progress, 0 when none is running.
    #[serde(default)]
    pub process_time: i64,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
}

impl ServiceBinding {
    /// The bundle to encode into the `ServicePackage`.
    pub fn service_resources(&self) -> ServiceResources {
        ServiceResources {
            workloads: self.workloads.clone(),
            permissions: self.permissions.clone(),
            crds: self.crd.clone(),
            capability_plugin: self.capability_plugin.clone(),
        }
    }

    /// One resource row per served version of every CRD in the bundle.
    pub fn resource_records(&self) -> Result<Vec<ResourceRecord>> {
        let mut records: Vec<ResourceRecord> = Vec::new();
        for crd in &self.crd {
            let shape = CrdShape::parse(crd)?;
            for version in &shape.versions {
                let api_version = format!("{}/{version}", shape.group);
                let duplicate = records
                    .iter()
                    .any(|r| r.kind == shape.kind && r.api_version == api_version);
                if duplicate {
                    continue;
                }
                records.push(ResourceRecord {
                    service_binding_id: self.id.clone(),
                    kind: shape.kind.clone(),
                    group: shape.group.clone(),
                    api_version,
                    plural: shape.plural.clone(),
                    ..Default::default()
                });
            }
        }
        Ok(records)
    }
}

/// A custom resource type a binding's operator serves.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub service_binding_id: String,
    pub kind: String,
    pub group: String,
    pub api_version: String,
    pub plural: String,
    #[serde(default)]
    pub create_time: i64,
    #[serde(default)]
    pub update_time: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::resources::fixtures::sample_crd;

    #[test]
    fn resource_records_follow_served_versions() {
        let mut v1beta1 = sample_crd("apiextensions.k8s.io/v1beta1");
        v1beta1["spec"]["versions"] = json!([{ "name": "v1", "served": true }]);
        let binding = ServiceBinding {
            id: "b-1".into(),
            name: "mysql".into(),
            crd: vec![sample_crd("apiextensions.k8s.io/v1"), v1beta1],
            ..Default::default()
        };

        let records = binding.resource_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].api_version, "db.example.com/v1");
        assert_eq!(records[0].plural, "mysqls");
        assert_eq!(records[0].service_binding_id, "b-1");
    }
}
