use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle status of a binding or instance row.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LifecycleStatus {
    #[default]
    Installing,
    Initializing,
    Initialized,
    InitFailed,
    Upgrading,
    UpgradeFailed,
    RollingBack,
    RollBackFailed,
    Deleting,
    DeleteFailed,
    Succeeded,
    Failed,
}

/// Statuses of bindings the async processor works on.
pub const BINDING_CARE_SET: &[LifecycleStatus] = &[
    LifecycleStatus::Installing,
    LifecycleStatus::Upgrading,
    LifecycleStatus::RollingBack,
    LifecycleStatus::Deleting,
];

/// Statuses of instances the async processor works on.
pub const INSTANCE_CARE_SET: &[LifecycleStatus] = &[
    LifecycleStatus::Initializing,
    LifecycleStatus::Upgrading,
    LifecycleStatus::Deleting,
];

impl LifecycleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleStatus::Installing => "Installing",
            LifecycleStatus::Initializing => "Initializing",
            LifecycleStatus::Initialized => "Initialized",
            LifecycleStatus::InitFailed => "InitFailed",
            LifecycleStatus::Upgrading => "Upgrading",
            LifecycleStatus::UpgradeFailed => "UpgradeFailed",
            LifecycleStatus::RollingBack => "RollingBack",
            LifecycleStatus::RollBackFailed => "RollBackFailed",
            LifecycleStatus::Deleting => "Deleting",
            LifecycleStatus::DeleteFailed => "DeleteFailed",
            LifecycleStatus::Succeeded => "Succeeded",
            LifecycleStatus::Failed => "Failed",
        }
    }

    /// The status a row moves to when work in this status gives up.
    pub fn failed(self) -> LifecycleStatus {
        match self {
            LifecycleStatus::Deleting => LifecycleStatus::DeleteFailed,
            LifecycleStatus::Upgrading => LifecycleStatus::UpgradeFailed,
            LifecycleStatus::RollingBack => LifecycleStatus::RollBackFailed,
            LifecycleStatus::Initializing => LifecycleStatus::InitFailed,
            _ => LifecycleStatus::Failed,
        }
    }

    pub fn is_failed(self) -> bool {
        matches!(
            self,
            LifecycleStatus::InitFailed
                | LifecycleStatus::UpgradeFailed
                | LifecycleStatus::RollBackFailed
                | LifecycleStatus::DeleteFailed
                | LifecycleStatus::Failed
        )
    }
}

impl Display for LifecycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [LifecycleStatus; 12] = [
            LifecycleStatus::Installing,
            LifecycleStatus::Initializing,
            LifecycleStatus::Initialized,
            LifecycleStatus::InitFailed,
            LifecycleStatus::Upgrading,
            LifecycleStatus::UpgradeFailed,
            LifecycleStatus::RollingBack,
            LifecycleStatus::RollBackFailed,
            LifecycleStatus::Deleting,
            LifecycleStatus::DeleteFailed,
            LifecycleStatus::Succeeded,
            LifecycleStatus::Failed,
        ];
        ALL.into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::ValidationError(format!("unknown lifecycle status {s:?}")))
    }
}
