use base64::{engine::general_purpose::STANDARD, Engine as _};
use k8s_openapi::api::{
    apps::v1::{DaemonSet, Deployment, StatefulSet},
    rbac::v1::PolicyRule,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Everything an operator bundle asks the engine to put into the cluster.
///
/// This is the document carried base64-encoded in `spec.resources` of a
/// `ServicePackage`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResources {
    /// Operator workloads.
    #[serde(default)]
    pub workloads: Workloads,

    /// Service accounts and the cluster-wide rules granted to them.
    #[serde(default)]
    pub permissions: Vec<Permission>,

    /// Raw custom resource definitions, either `apiextensions.k8s.io/v1` or `v1beta1`.
    #[serde(default)]
    pub crds: Vec<Value>,

    /// Opaque capability plugin descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_plugin: Option<Value>,
}

/// The operator workloads of a bundle.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct Workloads {
    pub deployments: Vec<Deployment>,
    pub daemon_sets: Vec<DaemonSet>,
    pub stateful_sets: Vec<StatefulSet>,
}

impl Workloads {
    pub fn is_empty(&self) -> bool {
        self.deployments.is_empty() && self.daemon_sets.is_empty() && self.stateful_sets.is_empty()
    }
}

/// A service account together with the rules of its cluster role.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub service_account_name: String,

    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

/// Encode a bundle the way it is stored in `spec.resources`.
pub fn resources_to_base64(resources: &ServiceResources) -> Result<String> {
    let json = serde_json::to_vec(resources)?;
    Ok(STANDARD.encode(json))
}

/// Decode `spec.resources`. An empty string decodes to an empty bundle.
pub fn base64_to_resources(code: &str) -> Result<ServiceResources> {
    if code.trim().is_empty() {
        return Ok(ServiceResources::default());
    }
    let json = STANDARD.decode(code.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

/// The two schema variants a custom resource definition can be written in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrdVersion {
    V1,
    V1Beta1,
}

impl CrdVersion {
    pub const GROUP: &'static str = "apiextensions.k8s.io";

    pub fn api_version(self) -> &'static str {
        match self {
            CrdVersion::V1 => "apiextensions.k8s.io/v1",
            CrdVersion::V1Beta1 => "apiextensions.k8s.io/v1beta1",
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            CrdVersion::V1 => "v1",
            CrdVersion::V1Beta1 => "v1beta1",
        }
    }

    pub fn from_api_version(api_version: &str) -> Option<Self> {
        match api_version {
            "apiextensions.k8s.io/v1" => Some(CrdVersion::V1),
            "apiextensions.k8s.io/v1beta1" => Some(CrdVersion::V1Beta1),
            _ => None,
        }
    }
}

/// The addressing information of a custom resource definition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdShape {
    pub name: String,
    pub schema: CrdVersion,
    pub group: String,
    pub kind: String,
    pub plural: String,
    /// Served versions of the defined resource.
    pub versions: Vec<String>,
}

impl CrdShape {
    /// Read the addressing fields out of a raw CRD of either schema variant.
    pub fn parse(crd: &Value) -> Result<Self> {
        let field = |pointer: &str| -> Result<String> {
            crd.pointer(pointer)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::IllegalServicePackage(format!("crd is missing {pointer}")))
        };

        let api_version = field("/apiVersion")?;
        let schema = CrdVersion::from_api_version(&api_version).ok_or_else(|| {
            Error::IllegalServicePackage(format!("unsupported crd apiVersion {api_version}"))
        })?;

        let mut versions: Vec<String> = crd
            .pointer("/spec/versions")
            .and_then(Value::as_array)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|v| v.get("served").and_then(Value::as_bool).unwrap_or(true))
                    .filter_map(|v| v.get("name").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        // v1beta1 definitions may only carry the single legacy version field
        if versions.is_empty() {
            versions.extend(field("/spec/version").ok());
        }
        if versions.is_empty() {
            return Err(Error::IllegalServicePackage(format!(
                "crd {} serves no versions",
                field("/metadata/name")?
            )));
        }

        Ok(Self {
            name: field("/metadata/name")?,
            schema,
            group: field("/spec/group")?,
            kind: field("/spec/names/kind")?,
            plural: field("/spec/names/plural")?,
            versions,
        })
    }
}
