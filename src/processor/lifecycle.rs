use async_trait::async_trait;
use serde::Serialize;

use crate::{
    event::{BINDING_CHANNEL, INSTANCE_CHANNEL},
    model::{Instance, LifecycleStatus, ServiceBinding, BINDING_CARE_SET, INSTANCE_CARE_SET},
    Result,
};

/// What a handler wants to happen after it returns successfully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the next handler; after the last one the row is done.
    Next,
    /// Stop here and process the row again after the retry interval.
    Requeue { reason: String },
}

impl Flow {
    pub fn requeue(reason: impl Into<String>) -> Self {
        Flow::Requeue {
            reason: reason.into(),
        }
    }
}

/// The phase a status selects its handlers for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Install,
    Upgrade,
    Delete,
}

impl Phase {
    pub fn for_status(status: LifecycleStatus) -> Option<Self> {
        match status {
            LifecycleStatus::Installing | LifecycleStatus::Initializing => Some(Phase::Install),
            LifecycleStatus::Upgrading | LifecycleStatus::RollingBack => Some(Phase::Upgrade),
            LifecycleStatus::Deleting => Some(Phase::Delete),
            _ => None,
        }
    }
}

/// Handler triples per phase. Slots a kind does not need keep the default,
/// which lets processing continue.
#[async_trait]
pub trait LifecycleHandler<T: Send>: Send + Sync {
    async fn before_install(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn install(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn after_install(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn before_upgrade(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn upgrade(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn after_upgrade(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn before_delete(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn delete(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }

    async fn after_delete(&self, _row: &mut T) -> Result<Flow> {
        Ok(Flow::Next)
    }
}

/// Run the handler triple of `phase`, stopping at the first requeue or error.
pub async fn run_phase<T: Send>(
    handler: &dyn LifecycleHandler<T>,
    phase: Phase,
    row: &mut T,
) -> Result<Flow> {
    macro_rules! step {
        ($call:expr) => {
            match $call.await? {
                Flow::Next => {}
                requeue => return Ok(requeue),
            }
        };
    }

    match phase {
        Phase::Install => {
            step!(handler.before_install(row));
            step!(handler.install(row));
            step!(handler.after_install(row));
        }
        Phase::Upgrade => {
            step!(handler.before_upgrade(row));
            step!(handler.upgrade(row));
            step!(handler.after_upgrade(row));
        }
        Phase::Delete => {
            step!(handler.before_delete(row));
            step!(handler.delete(row));
            step!(handler.after_delete(row));
        }
    }
    Ok(Flow::Next)
}

/// A database row a processor drives.
pub trait Record: Serialize + Clone + Send + Sync + 'static {
    /// Label used in logs and metrics.
    const KIND: &'static str;

    /// Event bus channel carrying rows of this kind.
    const CHANNEL: &'static str;

    /// Statuses this kind's processor works on.
    fn care_set() -> &'static [LifecycleStatus];

    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn status(&self) -> LifecycleStatus;
    fn update_time(&self) -> i64;
    fn process_time(&self) -> i64;
}

impl Record for ServiceBinding {
    const KIND: &'static str = "servicebinding";
    const CHANNEL: &'static str = BINDING_CHANNEL;

    fn care_set() -> &'static [LifecycleStatus] {
        BINDING_CARE_SET
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> LifecycleStatus {
        self.status
    }

    fn update_time(&self) -> i64 {
        self.update_time
    }

    fn process_time(&self) -> i64 {
        self.process_time
    }
}

impl Record for Instance {
    const KIND: &'static str = "serviceinstance";
    const CHANNEL: &'static str = INSTANCE_CHANNEL;

    fn care_set() -> &'static [LifecycleStatus] {
        INSTANCE_CARE_SET
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> LifecycleStatus {
        self.status
    }

    fn update_time(&self) -> i64 {
        self.update_time
    }

    fn process_time(&self) -> i64 {
        self.process_time
    }
}

/// Persistence a processor needs for its kind.
#[async_trait]
pub trait Repository<T>: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<T>>;

    async fn list_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<T>>;

    /// Reset the step deadline of a row that finished its phase.
    async fn clear_process_time(&self, row: &mut T) -> Result<()>;

    /// Keep the reason a row is still waiting, without restarting its time budget.
    async fn record_message(&self, row: &mut T, message: &str) -> Result<()>;

    /// Record a failed status with `message`, clearing the step deadline.
    /// Fails with [`crate::Error::Conflict`] once the row left the status it was loaded with.
    async fn mark_failed(&self, row: &mut T, status: LifecycleStatus, message: &str) -> Result<()>;
}
