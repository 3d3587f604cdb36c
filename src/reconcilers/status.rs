use chrono::Utc;
use kube::Resource;
use serde_json::{json, Value};

use crate::{
    resources::{PackagePhase, ServicePackage, ServicePackageStatus},
    Error,
};

/// Longest `status.reason` kept on a package.
pub(crate) const MAX_REASON_LEN: usize = 1024;

const SEPARATOR: &str = "; ";

/// The status the version pair asks for before reconciling, `None` when it stays.
pub(crate) fn verify_status(package: &ServicePackage) -> Option<ServicePackageStatus> {
    let status = package.status.clone().unwrap_or_default();
    let desired = package.spec.version.as_str();
    let current = status.current_version.as_str();

    let (phase, reason) = if status.phase == PackagePhase::Deleted {
        return None;
    } else if desired.is_empty() {
        (PackagePhase::Deleting, format!("removing version {current}"))
    } else if current.is_empty() {
        (PackagePhase::Pending, format!("installing version {desired}"))
    } else if desired != current {
        (PackagePhase::Upgrading, format!("upgrading from {current} to {desired}"))
    } else {
        return None;
    };

    if package.status.is_some() && status.phase == phase {
        return None;
    }
    Some(ServicePackageStatus {
        phase,
        reason,
        ..status
    })
}

/// The status after sub-resources were reconciled.
///
/// Converging phases settle on success; any error fails the package.
pub(crate) fn after_reconcile(
    status: &ServicePackageStatus,
    version: &str,
    error: Option<&Error>,
) -> ServicePackageStatus {
    if let Some(error) = error {
        return ServicePackageStatus {
            phase: PackagePhase::Failed,
            reason: accumulate(status, &error.to_string()),
            ..status.clone()
        };
    }
    match status.phase {
        PackagePhase::Pending | PackagePhase::Upgrading => ServicePackageStatus {
            phase: PackagePhase::Succeeded,
            current_version: version.to_string(),
            reason: format!("version {version} installed"),
            ..status.clone()
        },
        PackagePhase::Deleting => ServicePackageStatus {
            phase: PackagePhase::Deleted,
            current_version: String::new(),
            reason: "owned resources removed".into(),
            ..status.clone()
        },
        _ => status.clone(),
    }
}

/// The status after the workload health check.
pub(crate) fn after_runtime_check(
    status: &ServicePackageStatus,
    phase: PackagePhase,
    reasons: &[String],
) -> ServicePackageStatus {
    let reason = if phase == PackagePhase::Running {
        String::new()
    } else {
        accumulate(status, &reasons.join(SEPARATOR))
    };
    ServicePackageStatus {
        phase,
        reason,
        ..status.clone()
    }
}

/// Same phase, version and reason. The schedule time is ignored.
pub(crate) fn same_status(a: &ServicePackageStatus, b: &ServicePackageStatus) -> bool {
    a.phase == b.phase && a.current_version == b.current_version && a.reason == b.reason
}

/// Server-side apply body writing `status`.
pub(crate) fn status_patch(status: &ServicePackageStatus) -> Value {
    let status = ServicePackageStatus {
        last_schedule_time: Some(Utc::now()),
        ..status.clone()
    };
    json!({
        "apiVersion": ServicePackage::api_version(&()),
        "kind": ServicePackage::kind(&()),
        "status": status,
    })
}

/// Append `reason` to the history of a package already in trouble.
///
/// Segments are kept once each and the oldest are dropped past [`MAX_REASON_LEN`].
fn accumulate(status: &ServicePackageStatus, reason: &str) -> String {
    let history = if status.phase.is_exception() {
        status.reason.as_str()
    } else {
        ""
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in history.split(SEPARATOR).chain(reason.split(SEPARATOR)) {
        if segment.is_empty() {
            continue;
        }
        segments.retain(|s| *s != segment);
        segments.push(segment);
    }

    let mut joined = segments.join(SEPARATOR);
    while joined.len() > MAX_REASON_LEN && segments.len() > 1 {
        segments.remove(0);
        joined = segments.join(SEPARATOR);
    }
    if joined.len() > MAX_REASON_LEN {
        let mut start = joined.len() - MAX_REASON_LEN;
        while !joined.is_char_boundary(start) {
            start += 1;
        }
        joined = joined[start..].to_string();
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ServicePackageSpec;

    fn package(version: &str, phase: PackagePhase, current: &str) -> ServicePackage {
        let mut package = ServicePackage::new(
            "mysql",
            ServicePackageSpec {
                version: version.into(),
                ..Default::default()
            },
        );
        package.status = Some(ServicePackageStatus {
            phase,
            current_version: current.into(),
            ..Default::default()
        });
        package
    }

    #[test]
    fn version_pair_decides_the_phase() {
        let fresh = verify_status(&package("1.0.0", PackagePhase::Failed, "")).unwrap();
        assert_eq!(fresh.phase, PackagePhase::Pending);

        let upgrade = verify_status(&package("1.0.1", PackagePhase::Running, "1.0.0")).unwrap();
        assert_eq!(upgrade.phase, PackagePhase::Upgrading);
        assert_eq!(upgrade.current_version, "1.0.0");

        let delete = verify_status(&package("", PackagePhase::Running, "1.0.0")).unwrap();
        assert_eq!(delete.phase, PackagePhase::Deleting);

        assert!(verify_status(&package("", PackagePhase::Deleted, "")).is_none());
        assert!(verify_status(&package("1.0.0", PackagePhase::Running, "1.0.0")).is_none());
        assert!(verify_status(&package("1.0.1", PackagePhase::Upgrading, "1.0.0")).is_none());

        let mut unwritten = package("1.0.0", PackagePhase::Pending, "");
        unwritten.status = None;
        assert_eq!(verify_status(&unwritten).unwrap().phase, PackagePhase::Pending);
    }

    #[test]
    fn success_settles_converging_phases() {
        let pending = package("1.0.0", PackagePhase::Pending, "").status.unwrap();
        let done = after_reconcile(&pending, "1.0.0", None);
        assert_eq!(done.phase, PackagePhase::Succeeded);
        assert_eq!(done.current_version, "1.0.0");

        let deleting = package("", PackagePhase::Deleting, "1.0.0").status.unwrap();
        let deleted = after_reconcile(&deleting, "", None);
        assert_eq!(deleted.phase, PackagePhase::Deleted);
        assert_eq!(deleted.current_version, "");

        let failed = after_reconcile(&pending, "1.0.0", Some(&Error::CrdError("boom".into())));
        assert_eq!(failed.phase, PackagePhase::Failed);
        assert_eq!(failed.reason, "CrdError: boom");
    }

    #[test]
    fn reasons_accumulate_only_while_in_trouble() {
        let mut status = ServicePackageStatus {
            phase: PackagePhase::Failed,
            reason: "a; b".into(),
            ..Default::default()
        };
        assert_eq!(accumulate(&status, "c"), "a; b; c");
        assert_eq!(accumulate(&status, "a"), "b; a");

        status.phase = PackagePhase::Succeeded;
        assert_eq!(accumulate(&status, "c"), "c");
    }

    #[test]
    fn reasons_are_capped() {
        let status = ServicePackageStatus {
            phase: PackagePhase::Unknown,
            reason: "x".repeat(1000),
            ..Default::default()
        };
        let reason = accumulate(&status, &"y".repeat(100));
        assert_eq!(reason, "y".repeat(100));

        let huge = accumulate(&ServicePackageStatus::default(), &"z".repeat(2000));
        assert_eq!(huge.len(), MAX_REASON_LEN);
    }
}
