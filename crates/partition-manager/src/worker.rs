//! Serial execution of driver mutations.
//!
//! Queued tasks run one at a time in FIFO order on a single consumer task.
//! Inline mutations share the same gate, so a queued task and an inline call
//! never touch the driver at the same time.

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::PartitionCache;
use crate::driver::PartitionDriver;
use crate::error::DriverResult;
use crate::error::ManagerError;
use crate::error::Result;

/// What a successful mutation reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationReport {
    pub message: String,
    /// Id of the instance or sub-partition the mutation created.
    pub created_id: Option<u32>,
}

impl MutationReport {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            created_id: None,
        }
    }

    pub fn created(message: impl Into<String>, id: u32) -> Self {
        Self {
            message: message.into(),
            created_id: Some(id),
        }
    }
}

pub type MutationOutcome = std::result::Result<MutationReport, ManagerError>;

pub type TaskBody = Box<dyn FnOnce(&dyn PartitionDriver) -> DriverResult<MutationReport> + Send>;

pub struct MutationTask {
    label: Cow<'static, str>,
    mutates_topology: bool,
    body: TaskBody,
    reply: oneshot::Sender<MutationOutcome>,
}

impl fmt::Debug for MutationTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationTask")
            .field("label", &self.label)
            .field("mutates_topology", &self.mutates_topology)
            .finish_non_exhaustive()
    }
}

impl MutationTask {
    /// Builds a task and the ticket its outcome will be delivered to.
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        mutates_topology: bool,
        body: TaskBody,
    ) -> (Self, MutationTicket) {
        let label = label.into();
        let (reply, receiver) = oneshot::channel();
        let task = Self {
            label: label.clone(),
            mutates_topology,
            body,
            reply,
        };
        (task, MutationTicket { label, receiver })
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Handle to the eventual outcome of a queued mutation.
#[derive(Debug)]
pub struct MutationTicket {
    label: Cow<'static, str>,
    receiver: oneshot::Receiver<MutationOutcome>,
}

impl MutationTicket {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Resolves to [`ManagerError::WorkerStopped`] if the task was dropped
    /// without running.
    pub async fn wait(self) -> MutationOutcome {
        self.receiver
            .await
            .unwrap_or(Err(ManagerError::WorkerStopped))
    }
}

/// Runs mutation bodies against the driver under the shared gate.
#[derive(Clone)]
pub struct MutationExecutor {
    driver: Arc<dyn PartitionDriver>,
    cache: Arc<PartitionCache>,
    gate: Arc<Mutex<()>>,
}

impl MutationExecutor {
    pub fn new(driver: Arc<dyn PartitionDriver>, cache: Arc<PartitionCache>) -> Self {
        Self {
            driver,
            cache,
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Runs `body` on the blocking pool. A successful topology mutation
    /// rebuilds the cache before this returns.
    pub async fn execute(&self, label: &str, mutates_topology: bool, body: TaskBody) -> MutationOutcome {
        let _gate = self.gate.lock().await;

        let driver = self.driver.clone();
        let result = tokio::task::spawn_blocking(move || body(driver.as_ref()))
            .await
            .map_err(|e| {
                tracing::error!(task = label, error = %e, "mutation task panicked");
                ManagerError::TaskPanicked(label.to_string())
            })?;

        match result {
            Ok(report) => {
                if mutates_topology {
                    self.cache.rebuild(self.driver.clone()).await;
                }
                tracing::info!(task = label, message = %report.message, "mutation succeeded");
                Ok(report)
            }
            Err(e) => {
                tracing::warn!(task = label, error = %e, "mutation failed");
                Err(e.into())
            }
        }
    }
}

/// Single consumer of the mutation queue.
pub struct MutationWorker {
    sender: mpsc::Sender<MutationTask>,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MutationWorker {
    pub fn spawn(executor: MutationExecutor, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let token = CancellationToken::new();
        let handle = tokio::spawn(run(executor, receiver, token.clone()));
        tracing::info!(capacity, "mutation worker started");
        Self {
            sender,
            token,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues without waiting for room.
    pub fn submit(&self, task: MutationTask) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(ManagerError::WorkerStopped);
        }
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => {
                tracing::warn!(task = task.label(), "mutation queue full");
                ManagerError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => ManagerError::WorkerStopped,
        })
    }

    /// Enqueues, waiting for room while the queue is full.
    pub async fn send(&self, task: MutationTask) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(ManagerError::WorkerStopped);
        }
        self.sender
            .send(task)
            .await
            .map_err(|_| ManagerError::WorkerStopped)
    }

    /// Stops the worker after its current task. Pending tasks are dropped.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "mutation worker task failed");
            }
            tracing::info!("mutation worker stopped");
        }
    }
}

async fn run(
    executor: MutationExecutor,
    mut receiver: mpsc::Receiver<MutationTask>,
    token: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            task = receiver.recv() => match task {
                Some(task) => task,
                None => break,
            },
        };

        let MutationTask {
            label,
            mutates_topology,
            body,
            reply,
        } = task;
        tracing::debug!(task = %label, "running mutation");
        let outcome = executor.execute(&label, mutates_topology, body).await;
        if reply.send(outcome).is_err() {
            tracing::debug!(task = %label, "mutation ticket dropped before completion");
        }
    }

    // Tickets of tasks still queued resolve to `WorkerStopped` once dropped.
    receiver.close();
    let mut dropped = 0;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::warn!(dropped, "discarded queued mutations on shutdown");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::driver::MockDriver;
    use crate::driver::PartitionMode;

    fn executor(driver: Arc<MockDriver>) -> (MutationExecutor, Arc<PartitionCache>) {
        let cache = Arc::new(PartitionCache::new());
        (MutationExecutor::new(driver, cache.clone()), cache)
    }

    fn enable(device: u32) -> TaskBody {
        Box::new(move |driver: &dyn PartitionDriver| {
            driver.set_partition_mode(device, PartitionMode::Enabled)?;
            Ok(MutationReport::new("enabled"))
        })
    }

    #[test(tokio::test)]
    async fn outcomes_follow_submission_order() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mode(0, PartitionMode::Enabled);
        driver.set_mutation_delay(Duration::from_millis(5));
        let (executor, _) = executor(driver.clone());
        let worker = MutationWorker::spawn(executor, 8);

        let mut tickets = Vec::new();
        for _ in 0..3 {
            let (task, ticket) = MutationTask::new(
                "create",
                true,
                Box::new(|driver: &dyn PartitionDriver| {
                    let id = driver.create_instance(0, 19)?;
                    Ok(MutationReport::created("created", id))
                }),
            );
            worker.submit(task).expect("submit");
            tickets.push(ticket);
        }

        let mut ids = Vec::new();
        for ticket in tickets {
            ids.push(ticket.wait().await.expect("create").created_id);
        }
        assert_eq!(ids, vec![Some(1), Some(2), Some(3)]);
        assert_eq!(driver.max_concurrent_mutations(), 1);
        worker.shutdown().await;
    }

    #[test(tokio::test)]
    async fn driver_failure_becomes_outcome() {
        let driver = Arc::new(MockDriver::new(1));
        driver.fail_mutations(Some("Insufficient Permissions"));
        let (executor, _) = executor(driver);
        let worker = MutationWorker::spawn(executor, 8);

        let (task, ticket) = MutationTask::new("enable", true, enable(0));
        worker.submit(task).expect("submit");
        let err = ticket.wait().await.expect_err("driver fails");
        assert_eq!(
            err.to_string(),
            "set partition mode failed: Insufficient Permissions"
        );

        // The worker keeps serving after a failure.
        let (task, ticket) = MutationTask::new(
            "noop",
            false,
            Box::new(|_: &dyn PartitionDriver| Ok(MutationReport::new("done"))),
        );
        worker.submit(task).expect("submit");
        assert_eq!(ticket.wait().await.expect("noop").message, "done");
        worker.shutdown().await;
    }

    #[test(tokio::test)]
    async fn panic_becomes_outcome() {
        let (executor, _) = executor(Arc::new(MockDriver::new(1)));
        let outcome = executor
            .execute(
                "explode",
                false,
                Box::new(|_: &dyn PartitionDriver| -> DriverResult<MutationReport> { panic!("boom") }),
            )
            .await;
        assert!(matches!(outcome, Err(ManagerError::TaskPanicked(label)) if label == "explode"));
    }

    #[test(tokio::test)]
    async fn topology_mutation_rebuilds_before_reply() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mode(0, PartitionMode::Enabled);
        let (executor, cache) = executor(driver);

        let report = executor
            .execute(
                "create",
                true,
                Box::new(|driver: &dyn PartitionDriver| {
                    let id = driver.create_instance(0, 0)?;
                    Ok(MutationReport::created("created", id))
                }),
            )
            .await
            .expect("create");
        assert_eq!(report.created_id, Some(1));
        assert_eq!(cache.len().await, 1);
    }

    #[test(tokio::test)]
    async fn full_queue_is_reported() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mutation_delay(Duration::from_millis(200));
        let (executor, _) = executor(driver);
        let worker = MutationWorker::spawn(executor, 1);

        let mut results = Vec::new();
        for _ in 0..4 {
            let (task, ticket) = MutationTask::new("enable", false, enable(0));
            results.push(worker.submit(task).map(|_| ticket));
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ManagerError::QueueFull))));
        worker.shutdown().await;
    }

    #[test(tokio::test)]
    async fn send_waits_for_room() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mutation_delay(Duration::from_millis(5));
        let (executor, _) = executor(driver.clone());
        let worker = MutationWorker::spawn(executor, 1);

        let mut tickets = Vec::new();
        for _ in 0..6 {
            let (task, ticket) = MutationTask::new("enable", false, enable(0));
            worker.send(task).await.expect("send");
            tickets.push(ticket);
        }
        for ticket in tickets {
            ticket.wait().await.expect("enable");
        }
        assert_eq!(driver.mutation_log().len(), 6);
        worker.shutdown().await;

        let (late, _) = MutationTask::new("late", false, enable(0));
        assert!(matches!(worker.send(late).await, Err(ManagerError::WorkerStopped)));
    }

    #[test(tokio::test)]
    async fn shutdown_drops_pending_tasks() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mutation_delay(Duration::from_millis(100));
        let (executor, _) = executor(driver);
        let worker = MutationWorker::spawn(executor, 8);

        let (first, first_ticket) = MutationTask::new("first", false, enable(0));
        let (second, second_ticket) = MutationTask::new("second", false, enable(0));
        worker.submit(first).expect("submit");
        worker.submit(second).expect("submit");
        tokio::time::sleep(Duration::from_millis(20)).await;

        worker.shutdown().await;
        assert!(first_ticket.wait().await.is_ok());
        assert!(matches!(
            second_ticket.wait().await,
            Err(ManagerError::WorkerStopped)
        ));

        let (late, _) = MutationTask::new("late", false, enable(0));
        assert!(matches!(worker.submit(late), Err(ManagerError::WorkerStopped)));
    }
}
