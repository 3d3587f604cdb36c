use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LifecycleStatus;

/// A step of instance installation.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionType {
    InstallOperator,
    CreateResource,
}

impl ConditionType {
    /// Conditions always appear in this order.
    pub const ORDER: [ConditionType; 2] =
        [ConditionType::InstallOperator, ConditionType::CreateResource];
}

impl Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    #[default]
    Waiting,
    Running,
    Success,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    #[serde(default)]
    pub status: ConditionStatus,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,
}

impl Condition {
    fn waiting(type_: ConditionType) -> Self {
        Self {
            type_,
            status: ConditionStatus::Waiting,
            message: String::new(),
            last_transition_time: None,
            retry_count: 0,
        }
    }
}

/// Progress of an instance through its install conditions.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstallState {
    pub phase: LifecycleStatus,

    #[serde(default)]
    pub sub_phase: Vec<Condition>,
}

impl Default for InstallState {
    fn default() -> Self {
        Self {
            phase: LifecycleStatus::Initializing,
            sub_phase: ConditionType::ORDER.into_iter().map(Condition::waiting).collect(),
        }
    }
}

impl InstallState {
    pub fn condition(&self, type_: ConditionType) -> Option<&Condition> {
        self.sub_phase.iter().find(|c| c.type_ == type_)
    }

    /// Every condition reached `Success`.
    pub fn is_complete(&self) -> bool {
        !self.sub_phase.is_empty()
            && self
                .sub_phase
                .iter()
                .all(|c| c.status == ConditionStatus::Success)
    }

    /// Restore the fixed condition order, adding any condition that is missing.
    fn normalize(&mut self) {
        let mut ordered = Vec::with_capacity(ConditionType::ORDER.len());
        for type_ in ConditionType::ORDER {
            let condition = self
                .sub_phase
                .iter()
                .find(|c| c.type_ == type_)
                .cloned()
                .unwrap_or_else(|| Condition::waiting(type_));
            ordered.push(condition);
        }
        self.sub_phase = ordered;
    }

    /// Move a condition to `status`, returning whether anything changed.
    ///
    /// `Success` never regresses, an identical status and message is a no-op, and
    /// the transition time only moves when the status does. Changing a condition
    /// completes every condition before it. Completing the last condition
    /// promotes the phase to `Initialized`.
    pub fn update_condition(
        &mut self,
        type_: ConditionType,
        status: ConditionStatus,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        self.normalize();
        let Some(index) = self.sub_phase.iter().position(|c| c.type_ == type_) else {
            return false;
        };
        let now = Utc::now();

        let condition = &mut self.sub_phase[index];
        if condition.status == ConditionStatus::Success {
            return false;
        }
        if condition.status == status && condition.message == message {
            return false;
        }
        if condition.status != status {
            if condition.status == ConditionStatus::Failed && status == ConditionStatus::Running {
                condition.retry_count += 1;
            }
            condition.last_transition_time = Some(now);
        }
        condition.status = status;
        condition.message = message;

        for earlier in &mut self.sub_phase[..index] {
            if earlier.status != ConditionStatus::Success {
                earlier.status = ConditionStatus::Success;
                earlier.message = format!("successful to {}", earlier.type_);
                earlier.last_transition_time = Some(now);
            }
        }

        if self.is_complete() {
            self.phase = LifecycleStatus::Initialized;
        }
        true
    }

    /// Fail every condition still running, returning the message of the first.
    pub fn fail_running(&mut self, phase: LifecycleStatus) -> Option<String> {
        let now = Utc::now();
        let mut first = None;
        for condition in &mut self.sub_phase {
            if condition.status != ConditionStatus::Running {
                continue;
            }
            if condition.message.is_empty() {
                condition.message = format!("timed out to do {}", condition.type_);
            }
            condition.status = ConditionStatus::Failed;
            condition.last_transition_time = Some(now);
            first.get_or_insert_with(|| condition.message.clone());
        }
        self.phase = phase;
        first
    }
}
