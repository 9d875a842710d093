//! Periodic cache rebuild and telemetry collection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::PartitionCache;
use crate::driver::PartitionDriver;
use crate::error::ManagerError;
use crate::error::Result;
use crate::telemetry::collect_samples;
use crate::telemetry::TelemetryStore;

/// One refresh cycle's worth of dependencies.
#[derive(Clone)]
pub(crate) struct Refresher {
    driver: Arc<dyn PartitionDriver>,
    cache: Arc<PartitionCache>,
    store: Arc<TelemetryStore>,
}

impl Refresher {
    pub(crate) fn new(
        driver: Arc<dyn PartitionDriver>,
        cache: Arc<PartitionCache>,
        store: Arc<TelemetryStore>,
    ) -> Self {
        Self {
            driver,
            cache,
            store,
        }
    }

    /// Rebuilds the cache, samples every cached partition and publishes the
    /// new snapshot.
    pub(crate) async fn cycle(&self) {
        self.cache.rebuild(self.driver.clone()).await;
        let partitions = self.cache.list_all().await;

        let driver = self.driver.clone();
        match tokio::task::spawn_blocking(move || collect_samples(driver.as_ref(), &partitions)).await {
            Ok(samples) => {
                tracing::debug!(samples = samples.len(), "telemetry refreshed");
                self.store.replace(samples).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "telemetry collection failed, keeping previous snapshot");
            }
        }
    }
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

/// Owns at most one background refresh task.
pub struct RefreshLoop {
    refresher: Refresher,
    senders: Arc<RwLock<Vec<mpsc::Sender<()>>>>,
    state: Mutex<Option<RunningLoop>>,
}

impl RefreshLoop {
    pub(crate) fn new(refresher: Refresher) -> Self {
        Self {
            refresher,
            senders: Default::default(),
            state: Mutex::new(None),
        }
    }

    /// Starts the loop, replacing any loop already running.
    pub async fn start(&self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(ManagerError::InvalidInterval(interval));
        }

        let mut state = self.state.lock().await;
        if let Some(previous) = state.take() {
            tracing::info!(
                old_interval_ms = previous.interval.as_millis() as u64,
                new_interval_ms = interval.as_millis() as u64,
                "restarting refresh loop"
            );
            Self::join(previous).await;
        }

        let token = CancellationToken::new();
        let refresher = self.refresher.clone();
        let senders = self.senders.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            run(refresher, senders, interval, loop_token).await;
        });

        tracing::info!(interval_ms = interval.as_millis() as u64, "refresh loop started");
        *state = Some(RunningLoop {
            token,
            handle,
            interval,
        });
        Ok(())
    }

    /// Stops the loop and waits for it to exit. Returns false if it was not
    /// running.
    pub async fn stop(&self) -> bool {
        let previous = self.state.lock().await.take();
        match previous {
            Some(running) => {
                Self::join(running).await;
                tracing::info!("refresh loop stopped");
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Runs a single cycle on the caller's task.
    pub async fn refresh_once(&self) {
        self.refresher.cycle().await;
        notify_subscribers(&self.senders).await;
    }

    /// Receives one message after every completed cycle.
    pub async fn subscribe(&self) -> mpsc::Receiver<()> {
        let (sender, receiver) = mpsc::channel(32);
        self.senders.write().await.push(sender);
        receiver
    }

    async fn join(running: RunningLoop) {
        running.token.cancel();
        if let Err(e) = running.handle.await {
            tracing::error!(error = %e, "refresh loop task failed");
        }
    }
}

impl Drop for RefreshLoop {
    fn drop(&mut self) {
        if let Some(running) = self.state.get_mut().take() {
            running.token.cancel();
        }
    }
}

async fn run(
    refresher: Refresher,
    senders: Arc<RwLock<Vec<mpsc::Sender<()>>>>,
    interval: Duration,
    token: CancellationToken,
) {
    loop {
        if token.is_cancelled() {
            break;
        }

        refresher.cycle().await;
        notify_subscribers(&senders).await;

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    tracing::debug!("refresh loop exited");
}

/// Notifies subscribers and drops closed channels. A subscriber that has
/// not drained its last notification is skipped.
async fn notify_subscribers(senders: &RwLock<Vec<mpsc::Sender<()>>>) {
    let sender_list = senders.read().await.clone();
    let mut valid_senders = Vec::with_capacity(sender_list.len());

    for sender in sender_list {
        match sender.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => valid_senders.push(sender),
            Err(mpsc::error::TrySendError::Closed(())) => {
                tracing::debug!("subscriber disconnected, cleaning up channel");
            }
        }
    }

    *senders.write().await = valid_senders;
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::driver::MockDriver;
    use crate::driver::PartitionMode;

    fn refresh_loop(driver: Arc<MockDriver>) -> (RefreshLoop, Arc<PartitionCache>, Arc<TelemetryStore>) {
        let cache = Arc::new(PartitionCache::new());
        let store = Arc::new(TelemetryStore::new());
        let refresher = Refresher::new(driver, cache.clone(), store.clone());
        (RefreshLoop::new(refresher), cache, store)
    }

    #[test(tokio::test)]
    async fn zero_interval_is_rejected() {
        let (refresh, _, _) = refresh_loop(Arc::new(MockDriver::new(1)));
        let err = refresh.start(Duration::ZERO).await.expect_err("zero interval");
        assert!(err.is_invalid_argument());
        assert!(!refresh.is_running().await);
    }

    #[test(tokio::test)]
    async fn cycle_publishes_samples() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mode(0, PartitionMode::Enabled);
        let (_, identity) = driver.insert_instance(0, 19).expect("insert");
        let (refresh, cache, store) = refresh_loop(driver);

        refresh.refresh_once().await;

        assert_eq!(cache.len().await, 1);
        assert!(store.get(&identity).await.is_some());
    }

    #[test(tokio::test)]
    async fn start_twice_keeps_one_loop() {
        let (refresh, _, _) = refresh_loop(Arc::new(MockDriver::new(1)));
        let mut updates = refresh.subscribe().await;

        refresh.start(Duration::from_millis(10)).await.expect("start");
        refresh.start(Duration::from_millis(20)).await.expect("restart");
        assert!(refresh.is_running().await);
        updates.recv().await.expect("a cycle should complete");

        assert!(refresh.stop().await);
        assert!(!refresh.is_running().await);
        assert!(!refresh.stop().await);
    }

    #[test(tokio::test)]
    async fn stop_interrupts_long_sleep() {
        let (refresh, _, _) = refresh_loop(Arc::new(MockDriver::new(1)));
        let mut updates = refresh.subscribe().await;
        refresh.start(Duration::from_secs(3600)).await.expect("start");
        updates.recv().await.expect("first cycle runs immediately");

        tokio::time::timeout(Duration::from_secs(5), refresh.stop())
            .await
            .expect("stop should not wait for the interval");
    }

    #[test(tokio::test)]
    async fn dropping_the_loop_cancels_its_task() {
        let (refresh, _, _) = refresh_loop(Arc::new(MockDriver::new(1)));
        let mut updates = refresh.subscribe().await;
        refresh.start(Duration::from_secs(3600)).await.expect("start");
        updates.recv().await.expect("first cycle runs immediately");

        drop(refresh);

        // The task holds the last handle on the subscriber list.
        let closed = tokio::time::timeout(Duration::from_secs(5), updates.recv())
            .await
            .expect("refresh task should exit after drop");
        assert_eq!(closed, None);
    }
}
