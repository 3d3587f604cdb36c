use serde::Serialize;

use crate::{
    model::{Instance, LifecycleStatus},
    resources::{PackagePhase, ServicePackage},
};

/// What the cluster says about one resource behind a row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceState {
    Running,
    Pending,
    NotFound,
    Abnormal,
}

impl ResourceState {
    pub fn of_package(package: Option<&ServicePackage>) -> Self {
        let Some(package) = package else {
            return ResourceState::NotFound;
        };
        match package.phase() {
            PackagePhase::Running | PackagePhase::Succeeded => ResourceState::Running,
            PackagePhase::Pending | PackagePhase::Upgrading | PackagePhase::Deleting => {
                ResourceState::Pending
            }
            PackagePhase::Failed | PackagePhase::Unknown | PackagePhase::Deleted => {
                ResourceState::Abnormal
            }
        }
    }

    pub fn of_instance(instance: &Instance, exists: bool) -> Self {
        match instance.status {
            LifecycleStatus::Initializing
            | LifecycleStatus::Upgrading
            | LifecycleStatus::RollingBack
            | LifecycleStatus::Deleting => ResourceState::Pending,
            status if status.is_failed() => ResourceState::Abnormal,
            _ if !exists => ResourceState::NotFound,
            _ => ResourceState::Running,
        }
    }
}

/// Phase shown to users, computed from the cluster resources behind a row.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct AggregatePhase {
    pub phase: String,
    pub message: String,
}

impl AggregatePhase {
    fn new(phase: &str, message: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            message: message.into(),
        }
    }
}

pub fn aggregate_phase(states: &[ResourceState]) -> AggregatePhase {
    let count = |state| states.iter().filter(|s| **s == state).count();
    let (running, pending, missing, abnormal) = (
        count(ResourceState::Running),
        count(ResourceState::Pending),
        count(ResourceState::NotFound),
        count(ResourceState::Abnormal),
    );
    let total = states.len();

    if total == 0 || pending == total {
        return AggregatePhase::new("Pending", "resources are still being installed");
    }
    if running == total {
        return AggregatePhase::new("Succeeded", "all resources are running");
    }
    if missing == total {
        return AggregatePhase::new(
            "Failed",
            "resources are missing from the cluster, remove the records from the database \
             first instead of cleaning up the cluster",
        );
    }
    if missing + pending == total {
        return AggregatePhase::new(
            "Unknown",
            format!("{missing} resources not found, {pending} resources pending"),
        );
    }

    let counts = format!(
        "{running} running, {pending} pending, {missing} not found, {abnormal} abnormal"
    );
    if abnormal > 0 || missing > 0 {
        AggregatePhase::new("Unknown", counts)
    } else {
        AggregatePhase::new("Pending", counts)
    }
}
