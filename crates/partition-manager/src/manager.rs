//! Public entry point: device discovery, mutations, cached reads and
//! monitoring control.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cache::PartitionCache;
use crate::cache::PartitionDescriptor;
use crate::config::ManagerConfig;
use crate::driver::PartitionDriver;
use crate::driver::PartitionMode;
use crate::driver::PartitionProfile;
use crate::error::DriverResult;
use crate::error::ManagerError;
use crate::error::Result;
use crate::layout::LayoutSnapshot;
use crate::layout::PartitionLayout;
use crate::monitor::RefreshLoop;
use crate::monitor::Refresher;
use crate::telemetry::collect_sample;
use crate::telemetry::collect_samples;
use crate::telemetry::TelemetrySample;
use crate::telemetry::TelemetryStore;
use crate::worker::MutationExecutor;
use crate::worker::MutationOutcome;
use crate::worker::MutationReport;
use crate::worker::MutationTask;
use crate::worker::MutationTicket;
use crate::worker::MutationWorker;
use crate::worker::TaskBody;

/// A physical device as discovered at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalDevice {
    pub index: u32,
    pub name: String,
    pub uuid: String,
}

pub struct PartitionManager {
    driver: Arc<dyn PartitionDriver>,
    devices: Vec<PhysicalDevice>,
    cache: Arc<PartitionCache>,
    store: Arc<TelemetryStore>,
    executor: MutationExecutor,
    worker: MutationWorker,
    refresh: RefreshLoop,
    config: ManagerConfig,
}

impl PartitionManager {
    /// Discovers devices, builds the initial cache and starts the mutation
    /// worker. Fails if the driver cannot enumerate devices or finds none.
    pub async fn init(driver: Arc<dyn PartitionDriver>, config: ManagerConfig) -> Result<Arc<Self>> {
        let devices = {
            let driver = driver.clone();
            tokio::task::spawn_blocking(move || discover_devices(driver.as_ref()))
                .await
                .map_err(|e| ManagerError::Initialization(e.to_string()))??
        };
        tracing::info!(devices = devices.len(), "discovered physical devices");

        let cache = Arc::new(PartitionCache::new());
        let store = Arc::new(TelemetryStore::new());
        let partitions = cache.rebuild(driver.clone()).await;
        tracing::info!(partitions, "initial partition scan complete");

        let executor = MutationExecutor::new(driver.clone(), cache.clone());
        let worker = MutationWorker::spawn(executor.clone(), config.queue_capacity);
        let refresh = RefreshLoop::new(Refresher::new(driver.clone(), cache.clone(), store.clone()));

        let manager = Arc::new(Self {
            driver,
            devices,
            cache,
            store,
            executor,
            worker,
            refresh,
            config,
        });

        if manager.config.start_monitoring {
            manager.start_monitoring(manager.config.refresh_interval).await?;
        }
        Ok(manager)
    }

    /// Stops the refresh loop and the mutation worker, waiting for both.
    pub async fn shutdown(&self) {
        self.refresh.stop().await;
        self.worker.shutdown().await;
        tracing::info!("partition manager shut down");
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn device_count(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn devices(&self) -> &[PhysicalDevice] {
        &self.devices
    }

    pub fn device_name(&self, device: u32) -> Result<&str> {
        self.check_device(device)?;
        Ok(&self.devices[device as usize].name)
    }

    fn check_device(&self, device: u32) -> Result<()> {
        let count = self.device_count();
        if device >= count {
            return Err(ManagerError::InvalidDeviceIndex {
                index: device,
                count,
            });
        }
        Ok(())
    }

    async fn check_profile(&self, device: u32, profile_id: u32) -> Result<()> {
        let profiles = self.available_profiles(device).await?;
        if profiles.iter().any(|p| p.profile_id == profile_id) {
            Ok(())
        } else {
            Err(ManagerError::UnknownProfile { device, profile_id })
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn PartitionDriver) -> DriverResult<T> + Send + 'static,
    {
        let driver = self.driver.clone();
        Ok(tokio::task::spawn_blocking(move || f(driver.as_ref()))
            .await
            .map_err(|e| ManagerError::TaskPanicked(e.to_string()))??)
    }

    pub async fn set_partition_mode(&self, device: u32, mode: PartitionMode) -> MutationOutcome {
        self.check_device(device)?;
        let (label, body) = set_mode_task(device, mode);
        self.executor.execute(&label, true, body).await
    }

    pub async fn submit_set_partition_mode(
        &self,
        device: u32,
        mode: PartitionMode,
    ) -> Result<MutationTicket> {
        self.check_device(device)?;
        let (label, body) = set_mode_task(device, mode);
        self.enqueue(label, true, body)
    }

    pub async fn create_instance(&self, device: u32, profile_id: u32) -> MutationOutcome {
        self.check_device(device)?;
        self.check_profile(device, profile_id).await?;
        let (label, body) = create_instance_task(device, profile_id);
        self.executor.execute(&label, true, body).await
    }

    pub async fn submit_create_instance(
        &self,
        device: u32,
        profile_id: u32,
    ) -> Result<MutationTicket> {
        self.check_device(device)?;
        self.check_profile(device, profile_id).await?;
        let (label, body) = create_instance_task(device, profile_id);
        self.enqueue(label, true, body)
    }

    pub async fn destroy_instance(&self, device: u32, instance_id: u32) -> MutationOutcome {
        self.check_device(device)?;
        let (label, body) = destroy_instance_task(device, instance_id);
        self.executor.execute(&label, true, body).await
    }

    pub async fn submit_destroy_instance(
        &self,
        device: u32,
        instance_id: u32,
    ) -> Result<MutationTicket> {
        self.check_device(device)?;
        let (label, body) = destroy_instance_task(device, instance_id);
        self.enqueue(label, true, body)
    }

    pub async fn create_sub_partition(
        &self,
        device: u32,
        instance_id: u32,
        profile_id: u32,
    ) -> MutationOutcome {
        self.check_device(device)?;
        let (label, body) = create_sub_partition_task(device, instance_id, profile_id);
        self.executor.execute(&label, true, body).await
    }

    pub async fn submit_create_sub_partition(
        &self,
        device: u32,
        instance_id: u32,
        profile_id: u32,
    ) -> Result<MutationTicket> {
        self.check_device(device)?;
        let (label, body) = create_sub_partition_task(device, instance_id, profile_id);
        self.enqueue(label, true, body)
    }

    fn enqueue(&self, label: String, mutates_topology: bool, body: TaskBody) -> Result<MutationTicket> {
        let (task, ticket) = MutationTask::new(label, mutates_topology, body);
        tracing::debug!(task = task.label(), "queueing mutation");
        self.worker.submit(task)?;
        Ok(ticket)
    }

    async fn enqueue_waiting(&self, label: String, body: TaskBody) -> Result<MutationTicket> {
        let (task, ticket) = MutationTask::new(label, true, body);
        tracing::debug!(task = task.label(), "queueing mutation");
        self.worker.send(task).await?;
        Ok(ticket)
    }

    pub async fn partition_mode(&self, device: u32) -> Result<PartitionMode> {
        self.check_device(device)?;
        self.blocking(move |driver| driver.partition_mode(device)).await
    }

    pub async fn available_profiles(&self, device: u32) -> Result<Vec<PartitionProfile>> {
        self.check_device(device)?;
        self.blocking(move |driver| driver.available_profiles(device)).await
    }

    pub async fn partitions(&self, device: u32) -> Result<Vec<PartitionDescriptor>> {
        self.check_device(device)?;
        Ok(self.cache.list_by_device(device).await)
    }

    /// Every cached partition, scanning first if nothing is cached yet.
    pub async fn all_partitions(&self) -> Vec<PartitionDescriptor> {
        if self.cache.is_empty().await {
            self.cache.rebuild(self.driver.clone()).await;
        }
        self.cache.list_all().await
    }

    pub async fn find_partition(&self, identity: &str) -> Option<PartitionDescriptor> {
        self.cache.lookup(identity).await
    }

    /// Rebuilds the cache now. Returns the number of partitions found.
    pub async fn refresh(&self) -> usize {
        self.cache.rebuild(self.driver.clone()).await
    }

    /// Latest telemetry for a partition. `None` if the identity is not
    /// currently cached.
    pub async fn metrics(&self, identity: &str) -> Result<Option<TelemetrySample>> {
        let Some(partition) = self.cache.lookup(identity).await else {
            return Ok(None);
        };
        if let Some(sample) = self.store.get(identity).await {
            return Ok(Some(sample));
        }

        let sample = self
            .blocking(move |driver| Ok(collect_sample(driver, &partition)))
            .await?;
        Ok(Some(sample))
    }

    /// Telemetry for every cached partition. Samples come from the last
    /// refresh where present; partitions it has not seen yet are sampled on
    /// the spot.
    pub async fn all_metrics(&self) -> Result<HashMap<String, TelemetrySample>> {
        let snapshot = self.store.snapshot().await;
        let (sampled, missing): (Vec<_>, Vec<_>) = self
            .all_partitions()
            .await
            .into_iter()
            .partition(|p| snapshot.contains_key(&p.identity));

        let mut metrics: HashMap<String, TelemetrySample> = sampled
            .into_iter()
            .filter_map(|p| {
                let sample = snapshot.get(&p.identity)?.clone();
                Some((p.identity, sample))
            })
            .collect();
        if !missing.is_empty() {
            tracing::debug!(missing = missing.len(), "sampling partitions absent from last refresh");
            let fresh = self
                .blocking(move |driver| Ok(collect_samples(driver, &missing)))
                .await?;
            metrics.extend(fresh);
        }
        Ok(metrics)
    }

    pub async fn start_monitoring(&self, interval: Duration) -> Result<()> {
        self.refresh.start(interval).await
    }

    pub async fn stop_monitoring(&self) -> bool {
        self.refresh.stop().await
    }

    pub async fn is_monitoring(&self) -> bool {
        self.refresh.is_running().await
    }

    /// Receives a message after every refresh cycle.
    pub async fn subscribe(&self) -> mpsc::Receiver<()> {
        self.refresh.subscribe().await
    }

    pub async fn layout(&self) -> LayoutSnapshot {
        LayoutSnapshot::from_descriptors(&self.all_partitions().await)
    }

    pub async fn save_layout(&self, path: impl AsRef<Path>) -> Result<()> {
        self.refresh().await;
        self.layout().await.save(path).await
    }

    pub async fn apply_layout(&self, path: impl AsRef<Path>) -> Result<Vec<MutationTicket>> {
        let snapshot = LayoutSnapshot::load(path).await?;
        self.apply_layout_snapshot(&snapshot).await
    }

    /// Queues the mutations that reconcile each listed device with the
    /// snapshot, destroys before creates. Waits for queue room rather than
    /// failing partway, so a plan larger than the queue is still queued in
    /// full. Tickets are returned in submission order.
    pub async fn apply_layout_snapshot(&self, snapshot: &LayoutSnapshot) -> Result<Vec<MutationTicket>> {
        snapshot.validate()?;
        for device in &snapshot.devices {
            self.check_device(device.index)?;
        }

        self.refresh().await;
        let current = self.cache.list_all().await;

        let mut tickets = Vec::new();
        for device in &snapshot.devices {
            let diff = snapshot.diff(device.index, &current);
            if diff.is_empty() {
                tracing::debug!(device = device.index, "device already matches layout");
                continue;
            }
            tracing::info!(
                device = device.index,
                create = diff.to_create.len(),
                destroy = diff.to_destroy.len(),
                "reconciling device with layout"
            );

            for instance_id in diff.to_destroy {
                let (label, body) = destroy_instance_task(device.index, instance_id);
                tickets.push(self.enqueue_waiting(label, body).await?);
            }
            for entry in diff.to_create {
                let (label, body) = create_layout_entry_task(device.index, entry);
                tickets.push(self.enqueue_waiting(label, body).await?);
            }
        }
        Ok(tickets)
    }
}

fn discover_devices(driver: &dyn PartitionDriver) -> Result<Vec<PhysicalDevice>> {
    let count = driver
        .device_count()
        .map_err(|e| ManagerError::Initialization(e.to_string()))?;
    if count == 0 {
        return Err(ManagerError::NoDevices);
    }

    Ok((0..count)
        .map(|index| {
            let name = driver.device_name(index).unwrap_or_else(|e| {
                tracing::warn!(device = index, error = %e, "failed to read device name");
                String::new()
            });
            let uuid = driver.device_uuid(index).unwrap_or_else(|e| {
                tracing::warn!(device = index, error = %e, "failed to read device uuid");
                String::new()
            });
            tracing::info!(device = index, %name, %uuid, "found device");
            PhysicalDevice { index, name, uuid }
        })
        .collect())
}

fn set_mode_task(device: u32, mode: PartitionMode) -> (String, TaskBody) {
    (
        format!("set partition mode {mode} on device {device}"),
        Box::new(move |driver: &dyn PartitionDriver| {
            driver.set_partition_mode(device, mode)?;
            Ok(MutationReport::new(format!(
                "partition mode {mode} on device {device}"
            )))
        }),
    )
}

fn create_instance_task(device: u32, profile_id: u32) -> (String, TaskBody) {
    (
        format!("create profile {profile_id} instance on device {device}"),
        Box::new(move |driver: &dyn PartitionDriver| {
            let id = driver.create_instance(device, profile_id)?;
            Ok(MutationReport::created(
                format!("created instance {id} with profile {profile_id} on device {device}"),
                id,
            ))
        }),
    )
}

fn destroy_instance_task(device: u32, instance_id: u32) -> (String, TaskBody) {
    (
        format!("destroy instance {instance_id} on device {device}"),
        Box::new(move |driver: &dyn PartitionDriver| {
            driver.destroy_instance(device, instance_id)?;
            Ok(MutationReport::new(format!(
                "destroyed instance {instance_id} on device {device}"
            )))
        }),
    )
}

fn create_sub_partition_task(device: u32, instance_id: u32, profile_id: u32) -> (String, TaskBody) {
    (
        format!("create profile {profile_id} sub-partition in instance {instance_id} on device {device}"),
        Box::new(move |driver: &dyn PartitionDriver| {
            let id = driver.create_sub_partition(device, instance_id, profile_id)?;
            Ok(MutationReport::created(
                format!("created sub-partition {id} in instance {instance_id} on device {device}"),
                id,
            ))
        }),
    )
}

/// Creates an instance and then each of its sub-partitions.
fn create_layout_entry_task(device: u32, entry: PartitionLayout) -> (String, TaskBody) {
    (
        format!("create layout profile {} on device {device}", entry.profile_id),
        Box::new(move |driver: &dyn PartitionDriver| {
            let id = driver.create_instance(device, entry.profile_id)?;
            for &profile_id in &entry.sub_partition_profiles {
                driver.create_sub_partition(device, id, profile_id)?;
            }
            Ok(MutationReport::created(
                format!(
                    "created instance {id} with profile {} and {} sub-partitions on device {device}",
                    entry.profile_id,
                    entry.sub_partition_profiles.len()
                ),
                id,
            ))
        }),
    )
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::driver::MockDriver;

    fn config() -> ManagerConfig {
        ManagerConfig {
            start_monitoring: false,
            ..Default::default()
        }
    }

    #[test(tokio::test)]
    async fn init_fails_without_devices() {
        let result = PartitionManager::init(Arc::new(MockDriver::new(0)), config()).await;
        assert!(matches!(result, Err(ManagerError::NoDevices)));
    }

    #[test(tokio::test)]
    async fn init_fails_when_driver_fails() {
        let driver = MockDriver::new(1);
        driver.fail_device_count(true);
        let result = PartitionManager::init(Arc::new(driver), config()).await;
        assert!(matches!(result, Err(ManagerError::Initialization(_))));
    }

    #[test(tokio::test)]
    async fn init_discovers_devices() {
        let manager = PartitionManager::init(Arc::new(MockDriver::new(2)), config())
            .await
            .expect("init");
        assert_eq!(manager.device_count(), 2);
        assert_eq!(
            manager.devices()[1].uuid,
            "GPU-00000000-0000-0000-0000-000000000001"
        );
        assert_eq!(
            manager.device_name(0).expect("device 0"),
            "NVIDIA A100-SXM4-40GB"
        );
        assert!(!manager.is_monitoring().await);
        manager.shutdown().await;
    }

    #[test(tokio::test)]
    async fn init_can_start_monitoring() {
        let manager = PartitionManager::init(Arc::new(MockDriver::new(1)), ManagerConfig::default())
            .await
            .expect("init");
        assert!(manager.is_monitoring().await);
        manager.shutdown().await;
        assert!(!manager.is_monitoring().await);
    }

    #[test(tokio::test)]
    async fn unknown_profile_is_rejected() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mode(0, PartitionMode::Enabled);
        let manager = PartitionManager::init(driver.clone(), config())
            .await
            .expect("init");

        let err = manager
            .create_instance(0, 42)
            .await
            .expect_err("profile 42 does not exist");
        assert_eq!(err.to_string(), "unknown profile 42 for device 0");
        assert!(driver.mutation_log().is_empty());
        manager.shutdown().await;
    }

    #[test(tokio::test)]
    async fn inline_create_updates_cache() {
        let driver = Arc::new(MockDriver::new(1));
        let manager = PartitionManager::init(driver.clone(), config())
            .await
            .expect("init");

        manager
            .set_partition_mode(0, PartitionMode::Enabled)
            .await
            .expect("enable");
        assert_eq!(
            manager.partition_mode(0).await.expect("mode"),
            PartitionMode::Enabled
        );

        let report = manager.create_instance(0, 9).await.expect("create");
        let instance_id = report.created_id.expect("instance id");
        let sub = manager
            .create_sub_partition(0, instance_id, 0)
            .await
            .expect("sub-partition");
        assert_eq!(sub.created_id, Some(0));

        let partitions = manager.partitions(0).await.expect("partitions");
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].profile_id, 9);
        assert_eq!(partitions[0].current_sub_partitions(), 1);
        manager.shutdown().await;
    }

    #[test(tokio::test)]
    async fn metrics_falls_back_to_fresh_sample() {
        let driver = Arc::new(MockDriver::new(1));
        driver.set_mode(0, PartitionMode::Enabled);
        let (instance_id, identity) = driver.insert_instance(0, 19).expect("insert");
        driver.set_utilization(0, instance_id, 70, 10);
        let manager = PartitionManager::init(driver, config()).await.expect("init");

        let sample = manager
            .metrics(&identity)
            .await
            .expect("metrics")
            .expect("cached partition");
        assert_eq!(sample.compute_utilization, 70);
        assert!(manager.metrics("MIG-unknown").await.expect("metrics").is_none());
        manager.shutdown().await;
    }

    #[test(tokio::test)]
    async fn save_and_apply_layout_on_another_host() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("layout.json");

        let source = Arc::new(MockDriver::new(1));
        source.set_mode(0, PartitionMode::Enabled);
        let (instance_id, _) = source.insert_instance(0, 14).expect("insert");
        source.insert_sub_partition(0, instance_id, 0).expect("sub");
        source.insert_instance(0, 19).expect("insert");
        let manager = PartitionManager::init(source, config()).await.expect("init");
        manager.save_layout(&path).await.expect("save");
        manager.shutdown().await;

        let target = Arc::new(MockDriver::new(1));
        target.set_mode(0, PartitionMode::Enabled);
        target.insert_instance(0, 0).expect("insert");
        let manager = PartitionManager::init(target.clone(), config())
            .await
            .expect("init");
        let tickets = manager.apply_layout(&path).await.expect("apply");
        assert_eq!(tickets.len(), 3);
        for ticket in tickets {
            ticket.wait().await.expect("layout step");
        }

        let profiles: Vec<_> = manager
            .partitions(0)
            .await
            .expect("partitions")
            .iter()
            .map(|p| (p.profile_id, p.current_sub_partitions()))
            .collect();
        assert_eq!(profiles, vec![(14, 1), (19, 0)]);
        assert!(target.mutation_log()[0].starts_with("destroy_instance"));
        manager.shutdown().await;
    }
}
