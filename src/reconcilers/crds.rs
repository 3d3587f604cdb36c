use kube::api::DynamicObject;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    resources::{CrdShape, CrdVersion},
    Error, Result,
};

use super::ClusterApi;

/// CRD schema variants the API server accepts, decided once from its version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrdGate {
    pub v1: bool,
    pub v1beta1: bool,
}

impl Default for CrdGate {
    fn default() -> Self {
        Self {
            v1: true,
            v1beta1: false,
        }
    }
}

impl CrdGate {
    /// Gate for a `GitVersion` such as `v1.21.3+k3s1`.
    ///
    /// Up to 1.15 only v1beta1 exists, 1.22 removed it. Unparseable versions
    /// are treated as recent.
    pub fn from_git_version(git_version: &str) -> Self {
        let Some(minor) = minor_version(git_version) else {
            warn!("cannot parse cluster version {git_version:?}, assuming v1 CRDs");
            return Self::default();
        };
        match minor {
            0..=15 => Self {
                v1: false,
                v1beta1: true,
            },
            16..=21 => Self {
                v1: true,
                v1beta1: true,
            },
            _ => Self::default(),
        }
    }

    pub fn allows(self, version: CrdVersion) -> bool {
        match version {
            CrdVersion::V1 => self.v1,
            CrdVersion::V1Beta1 => self.v1beta1,
        }
    }
}

fn minor_version(git_version: &str) -> Option<u32> {
    let mut parts = git_version.trim().strip_prefix('v')?.split('.');
    if parts.next()? != "1" {
        return None;
    }
    let minor: String = parts.next()?.chars().take_while(char::is_ascii_digit).collect();
    minor.parse().ok()
}

/// Create the CRDs of a bundle that do not exist yet. Existing ones are never touched.
///
/// Fails only when every attempted creation failed.
pub(crate) async fn deploy<C: ClusterApi>(cluster: &C, gate: CrdGate, crds: &[Value]) -> Result<()> {
    let (mut attempted, mut failed_v1, mut failed_v1beta1) = (0, 0, 0);

    for crd in crds {
        let shape = CrdShape::parse(crd)?;
        if !gate.allows(shape.schema) {
            info!("Skipping {} crd {}, not served by this cluster", shape.schema.version(), shape.name);
            continue;
        }

        let api = cluster.crds(shape.schema);
        // A failed lookup counts against the variant like a failed create
        let created = match api.get_opt(&shape.name).await {
            Ok(Some(_)) => continue,
            Ok(None) => match serde_json::from_value::<DynamicObject>(crd.clone()) {
                Ok(object) => api.create(&object).await.map(|_| ()),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e),
        };
        attempted += 1;
        match created {
            Ok(()) => info!("Created crd {}", shape.name),
            Err(e) => {
                warn!("cannot create crd {}: {e}", shape.name);
                match shape.schema {
                    CrdVersion::V1 => failed_v1 += 1,
                    CrdVersion::V1Beta1 => failed_v1beta1 += 1,
                }
            }
        }
    }

    let failed = failed_v1 + failed_v1beta1;
    if failed == 0 {
        Ok(())
    } else if failed == attempted {
        Err(Error::CrdError(format!(
            "all crds developed failed: {failed_v1} v1, {failed_v1beta1} v1beta1"
        )))
    } else {
        warn!("partial crds developed failed: {failed_v1} v1, {failed_v1beta1} v1beta1 of {attempted}");
        Ok(())
    }
}
