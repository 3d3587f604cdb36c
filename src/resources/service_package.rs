use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::{
    gen::SchemaGenerator,
    schema::{InstanceType, Schema, SchemaObject},
    JsonSchema,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Specification for an installed Cloud Native Service
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "ServicePackage",
    group = "core.kappital.io",
    version = "v1alpha1",
    status = "ServicePackageStatus",
    doc = "An operator bundle installed into the cluster",
    namespaced,
    shortname = "svcpkg",
    printcolumn = r#"{ "name": "version", "type": "string", "description": "desired version", "jsonPath": ".spec.version" }"#,
    printcolumn = r#"{ "name": "current", "type": "string", "description": "installed version", "jsonPath": ".status.currentVersion" }"#,
    printcolumn = r#"{ "name": "phase", "type": "string", "description": "package phase", "jsonPath": ".status.phase" }"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServicePackageSpec {
    /// Identifier of the service in the catalog it was installed from.
    #[serde(rename = "serviceID", default)]
    pub service_id: String,

    /// Name of the service.
    pub name: String,

    /// The version that should be installed.
    ///
    /// An empty version asks the engine to remove everything the package owns.
    #[serde(default)]
    pub version: String,

    /// Base64 encoding of the canonical JSON of the operator bundle.
    #[serde(default)]
    pub resources: String,

    /// Opaque resources passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub raw_resources: Option<serde_json::Value>,
}

/// The status of a service package
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePackageStatus {
    /// The current phase of the package
    #[serde(default)]
    pub phase: PackagePhase,

    /// The version whose resources were last reconciled successfully
    #[serde(default)]
    pub current_version: String,

    /// Human readable explanation of the phase
    #[serde(default)]
    pub reason: String,

    /// When the status was last written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_schedule_time: Option<DateTime<Utc>>,
}

/// The possible phases of a `ServicePackage`
#[derive(Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq)]
pub enum PackagePhase {
    /// Nothing has been installed yet.
    #[default]
    Pending,

    /// All workloads report healthy replicas.
    Running,

    /// Sub-resources were converged; health not yet checked.
    Succeeded,

    /// Reconciliation or a workload failed.
    Failed,

    /// Workloads exist but run no replicas for an unknown reason.
    Unknown,

    /// A new version is being rolled in place.
    Upgrading,

    /// Owned resources are being removed.
    Deleting,

    /// Owned resources were removed.
    Deleted,
}

impl PackagePhase {
    /// Phases describing a package that is not healthy.
    pub fn is_exception(self) -> bool {
        matches!(self, PackagePhase::Failed | PackagePhase::Unknown)
    }

    /// Phases during which sub-resources are still being converged.
    pub fn is_converging(self) -> bool {
        matches!(
            self,
            PackagePhase::Pending | PackagePhase::Upgrading | PackagePhase::Deleting
        )
    }

    /// Phases in which owned resources are removed instead of created.
    pub fn is_deleting(self) -> bool {
        matches!(self, PackagePhase::Deleting | PackagePhase::Deleted)
    }
}

impl Display for PackagePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl ServicePackage {
    /// The phase recorded in status, `Pending` when no status was written yet.
    pub fn phase(&self) -> PackagePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// The version recorded as installed, empty when nothing is installed.
    pub fn current_version(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.current_version.as_str())
            .unwrap_or_default()
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".into(), json!(true));
    schema.extensions.insert("nullable".into(), json!(true));
    Schema::Object(schema)
}
