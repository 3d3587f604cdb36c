//! Asynchronous lifecycle processing of bindings and instances.
//!
//! Each kind gets a [`Processor`]: a work queue of row ids fed by the event
//! bus and drained by a pool of workers. A worker loads the row, runs the
//! handler triple its status selects and then either finishes the row,
//! requeues it, or marks it failed once its time budget is spent.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::ProcessorSettings,
    event::{EventBus, EventObject, EventOp, EventProcessor},
    model::{unix_now, LifecycleStatus},
    Error, Metrics, Result,
};

mod binding;
mod instance;
mod lifecycle;
mod queue;

pub use binding::{package_for, BindingHandler, BINDING_DEADLINE};
pub use instance::{InstanceHandler, INSTANCE_CREATE_DEADLINE, INSTANCE_WAIT_DEADLINE};
pub use lifecycle::{run_phase, Flow, LifecycleHandler, Phase, Record, Repository};
pub use queue::WorkQueue;

/// How processing a single row ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The row finished its phase.
    Done,
    /// The row asked to be processed again later.
    Requeued,
    /// The row was marked with a failed status and will not be retried.
    Failed,
    /// The row is gone or not in a status this processor works on.
    Skipped,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::Requeued => "requeued",
            Outcome::Failed => "failed",
            Outcome::Skipped => "skipped",
        }
    }
}

/// Drives rows of one kind through their lifecycle.
pub struct Processor<T: Record> {
    repository: Arc<dyn Repository<T>>,
    handler: Arc<dyn LifecycleHandler<T>>,
    queue: Arc<WorkQueue<String>>,
    settings: ProcessorSettings,
    metrics: Metrics,
}

impl<T: Record> Processor<T> {
    pub fn new(
        repository: Arc<dyn Repository<T>>,
        handler: Arc<dyn LifecycleHandler<T>>,
        settings: ProcessorSettings,
        metrics: Metrics,
    ) -> Self {
        Self {
            repository,
            handler,
            queue: Arc::new(WorkQueue::new()),
            settings,
            metrics,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<String>> {
        &self.queue
    }

    /// Replay rows left in flight, then start the workers.
    ///
    /// Workers drain the queue and exit once `stop` flips to true.
    pub async fn start(
        self: &Arc<Self>,
        bus: &EventBus,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let pending = self.repository.list_by_status(T::care_set()).await?;
        info!("{} processor replaying {} rows", T::KIND, pending.len());
        for row in &pending {
            bus.add_event(row, EventOp::List, T::CHANNEL).await?;
        }

        let mut handles = Vec::with_capacity(self.settings.workers + 1);
        for worker in 0..self.settings.workers {
            let processor = self.clone();
            handles.push(tokio::spawn(async move {
                processor.run_worker().await;
                debug!("{} worker {worker} stopped", T::KIND);
            }));
        }

        let queue = self.queue.clone();
        handles.push(tokio::spawn(async move {
            while stop.changed().await.is_ok() {
                if *stop.borrow() {
                    break;
                }
            }
            queue.shut_down();
        }));
        Ok(handles)
    }

    async fn run_worker(&self) {
        while let Some(id) = self.queue.get().await {
            let outcome = self.process_item(&id).await;
            if outcome == Outcome::Requeued {
                self.queue.add_after(id.clone(), self.settings.retry_interval);
            }
            self.queue.done(&id);
        }
    }

    /// Process one row by id.
    #[instrument(skip(self), fields(kind = T::KIND))]
    pub async fn process_item(&self, id: &str) -> Outcome {
        let outcome = self.handle(id).await;
        self.metrics.processed(T::KIND, outcome.label());
        outcome
    }

    async fn handle(&self, id: &str) -> Outcome {
        let mut row = match self.repository.load(id).await {
            Ok(Some(row)) => row,
            Ok(None) => {
                debug!("{} {id} no longer exists", T::KIND);
                return Outcome::Skipped;
            }
            Err(e) if e.is_not_found() => return Outcome::Skipped,
            Err(e) => {
                warn!("cannot load {} {id}: {e}", T::KIND);
                return Outcome::Requeued;
            }
        };

        let status = row.status();
        let Some(phase) = Phase::for_status(status).filter(|_| T::care_set().contains(&status))
        else {
            debug!("{} {} is {status}, nothing to do", T::KIND, row.name());
            return Outcome::Skipped;
        };

        let reason = match run_phase(self.handler.as_ref(), phase, &mut row).await {
            Ok(Flow::Next) => {
                match self.repository.clear_process_time(&mut row).await {
                    Ok(()) => {}
                    // Removed or handed to another phase, the deadline went with it
                    Err(Error::Conflict(reason)) => debug!("{reason}"),
                    Err(e) => {
                        warn!("cannot clear deadline of {} {}: {e}", T::KIND, row.name());
                        return Outcome::Requeued;
                    }
                }
                info!("{} {} finished {phase:?}", T::KIND, row.name());
                return Outcome::Done;
            }
            Ok(Flow::Requeue { reason }) => reason,
            Err(Error::Conflict(reason)) => {
                info!("{} {} changed while in {phase:?}: {reason}", T::KIND, row.name());
                return Outcome::Requeued;
            }
            Err(e) if e.is_terminal() => {
                return self.fail(&mut row, status, &e.to_string()).await;
            }
            Err(e) => {
                warn!("{} {} {phase:?} failed: {e}", T::KIND, row.name());
                e.to_string()
            }
        };

        if self.timed_out(&row) {
            let timeout = Error::Timeout(format!("{} {phase:?} timed out: {reason}", T::KIND));
            return self.fail(&mut row, status, &timeout.to_string()).await;
        }
        debug!("{} {} requeued: {reason}", T::KIND, row.name());
        if let Err(e) = self.repository.record_message(&mut row, &reason).await {
            warn!("cannot record progress of {} {}: {e}", T::KIND, row.name());
        }
        Outcome::Requeued
    }

    /// Whether the row outlived its budget or its current step deadline.
    fn timed_out(&self, row: &T) -> bool {
        let now = unix_now();
        let budget = self.settings.timeout.as_secs() as i64;
        now > row.update_time() + budget || (row.process_time() != 0 && now > row.process_time())
    }

    async fn fail(&self, row: &mut T, status: LifecycleStatus, message: &str) -> Outcome {
        let failed = status.failed();
        error!("{} {} -> {failed}: {message}", T::KIND, row.name());
        match self.repository.mark_failed(row, failed, message).await {
            Ok(()) => Outcome::Failed,
            Err(e) => {
                warn!("cannot mark {} {} failed: {e}", T::KIND, row.name());
                Outcome::Requeued
            }
        }
    }
}

#[async_trait]
impl<T: Record> EventProcessor for Processor<T> {
    async fn process(&self, op: EventOp, object: EventObject) -> Result<()> {
        let id = object.id();
        if id.is_empty() {
            return Err(Error::ValidationError(format!("{op} event without id")));
        }
        debug!("{} {op} event for {id}", T::KIND);
        self.queue.add(id.to_string());
        Ok(())
    }
}

/// Deadline `duration` from now, as stored in `process_time`.
pub(crate) fn deadline_in(duration: Duration) -> i64 {
    unix_now() + duration.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::model::ServiceBinding;

    /// Rows kept in memory, recording the failed statuses written.
    #[derive(Default)]
    struct Rows {
        rows: Mutex<Vec<ServiceBinding>>,
    }

    impl Rows {
        fn get(&self, id: &str) -> ServiceBinding {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.id == id)
                .cloned()
                .unwrap()
        }
    }

    #[async_trait]
    impl Repository<ServiceBinding> for Rows {
        async fn load(&self, id: &str) -> Result<Option<ServiceBinding>> {
            Ok(self.rows.lock().unwrap().iter().find(|r| r.id == id).cloned())
        }

        async fn list_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<ServiceBinding>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|r| statuses.contains(&r.status))
                .cloned()
                .collect())
        }

        async fn clear_process_time(&self, row: &mut ServiceBinding) -> Result<()> {
            row.process_time = 0;
            self.save(row);
            Ok(())
        }

        async fn record_message(&self, row: &mut ServiceBinding, message: &str) -> Result<()> {
            row.message = message.into();
            self.save(row);
            Ok(())
        }

        async fn mark_failed(
            &self,
            row: &mut ServiceBinding,
            status: LifecycleStatus,
            message: &str,
        ) -> Result<()> {
            row.status = status;
            row.message = message.into();
            row.process_time = 0;
            self.save(row);
            Ok(())
        }
    }

    impl Rows {
        fn save(&self, row: &ServiceBinding) {
            let mut rows = self.rows.lock().unwrap();
            if let Some(existing) = rows.iter_mut().find(|r| r.id == row.id) {
                *existing = row.clone();
            }
        }
    }

    /// Install always waits, delete fails with a terminal error.
    struct Waiting;

    #[async_trait]
    impl LifecycleHandler<ServiceBinding> for Waiting {
        async fn install(&self, _row: &mut ServiceBinding) -> Result<Flow> {
            Ok(Flow::requeue("package not running"))
        }

        async fn delete(&self, _row: &mut ServiceBinding) -> Result<Flow> {
            Err(Error::ValidationError("bad bundle".into()))
        }
    }

    fn processor(rows: Vec<ServiceBinding>) -> (Arc<Rows>, Processor<ServiceBinding>) {
        let repository = Arc::new(Rows {
            rows: Mutex::new(rows),
        });
        let processor = Processor::new(
            repository.clone(),
            Arc::new(Waiting),
            ProcessorSettings::default(),
            Metrics::default(),
        );
        (repository, processor)
    }

    fn row(id: &str, status: LifecycleStatus, update_time: i64, process_time: i64) -> ServiceBinding {
        ServiceBinding {
            id: id.into(),
            name: id.into(),
            status,
            update_time,
            process_time,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rows_within_budget_are_requeued() {
        let now = unix_now();
        let (rows, processor) = processor(vec![row("a", LifecycleStatus::Installing, now, 0)]);
        assert_eq!(processor.process_item("a").await, Outcome::Requeued);
        assert_eq!(rows.get("a").status, LifecycleStatus::Installing);
    }

    #[tokio::test]
    async fn requeue_reason_is_kept_on_the_row() {
        let now = unix_now() - 60;
        let (rows, processor) = processor(vec![row("a", LifecycleStatus::Installing, now, 0)]);
        assert_eq!(processor.process_item("a").await, Outcome::Requeued);

        let waiting = rows.get("a");
        assert_eq!(waiting.message, "package not running");
        assert_eq!(waiting.update_time, now);
    }

    #[tokio::test]
    async fn rows_past_the_budget_fail_without_requeue() {
        let stale = unix_now() - 21 * 60;
        let (rows, processor) = processor(vec![row("a", LifecycleStatus::Installing, stale, 0)]);
        assert_eq!(processor.process_item("a").await, Outcome::Failed);

        let failed = rows.get("a");
        assert_eq!(failed.status, LifecycleStatus::Failed);
        assert!(failed.message.contains("package not running"));
    }

    #[tokio::test]
    async fn passed_step_deadline_fails_the_row() {
        let now = unix_now();
        let (rows, processor) =
            processor(vec![row("a", LifecycleStatus::Upgrading, now, now - 1)]);
        // Upgrade slots are defaults, so the row finishes instead
        assert_eq!(processor.process_item("a").await, Outcome::Done);
        assert_eq!(rows.get("a").process_time, 0);

        rows.save(&row("a", LifecycleStatus::Installing, now, now - 1));
        assert_eq!(processor.process_item("a").await, Outcome::Failed);
    }

    #[tokio::test]
    async fn terminal_errors_fail_with_the_phase_status() {
        let now = unix_now();
        let (rows, processor) = processor(vec![row("a", LifecycleStatus::Deleting, now, 0)]);
        assert_eq!(processor.process_item("a").await, Outcome::Failed);
        assert_eq!(rows.get("a").status, LifecycleStatus::DeleteFailed);
    }

    #[tokio::test]
    async fn rows_outside_the_care_set_or_missing_are_skipped() {
        let now = unix_now();
        let (_, processor) = processor(vec![row("a", LifecycleStatus::Succeeded, now, 0)]);
        assert_eq!(processor.process_item("a").await, Outcome::Skipped);
        assert_eq!(processor.process_item("missing").await, Outcome::Skipped);
    }

    #[tokio::test]
    async fn start_replays_rows_and_stops_on_signal() {
        let now = unix_now();
        let (_, processor) = processor(vec![
            row("a", LifecycleStatus::Installing, now, 0),
            row("b", LifecycleStatus::Succeeded, now, 0),
        ]);
        let processor = Arc::new(processor);
        let bus = Arc::new(EventBus::new());
        bus.register(
            crate::event::BINDING_CHANNEL,
            crate::event::decode_binding,
            processor.clone(),
        );

        let (stop, stopped) = watch::channel(false);
        let bus_handle = bus.start(stopped.clone()).unwrap();
        let handles = processor.start(&bus, stopped).await.unwrap();
        assert_eq!(handles.len(), ProcessorSettings::default().workers + 1);

        stop.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        bus_handle.await.unwrap();
        assert!(processor.queue().is_shutting_down());
    }
}
