use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

use crate::driver::PartitionDriver;
use crate::driver::SubPartition;

type Identity = String;

/// Everything the manager knows about one partition instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescriptor {
    pub device_index: u32,
    pub instance_id: u32,
    pub profile_id: u32,
    pub identity: Identity,
    /// Bytes
    pub memory_total: u64,
    pub compute_units: u32,
    pub max_sub_partitions: u32,
    /// Ordered by sub-partition id.
    pub sub_partitions: Vec<SubPartition>,
}

impl PartitionDescriptor {
    pub fn current_sub_partitions(&self) -> u32 {
        self.sub_partitions.len() as u32
    }

    pub fn sub_partition_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.sub_partitions.iter().map(|s| s.id)
    }
}

/// Identity-keyed view of every partition on every device.
///
/// Readers get point-in-time copies; a rebuild builds a fresh map off-lock
/// and swaps it in whole.
#[derive(Debug, Default)]
pub struct PartitionCache {
    entries: RwLock<Arc<HashMap<Identity, PartitionDescriptor>>>,
    rebuild_lock: Mutex<()>,
}

impl PartitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Re-enumerates all devices and replaces the cache. Returns the number
    /// of partitions now cached.
    pub async fn rebuild(&self, driver: Arc<dyn PartitionDriver>) -> usize {
        // Overlapping rebuilds could otherwise publish an older scan last.
        let _guard = self.rebuild_lock.lock().await;

        let scanned = tokio::task::spawn_blocking(move || scan_partitions(driver.as_ref())).await;
        match scanned {
            Ok(map) => {
                let count = map.len();
                *self.entries.write().await = Arc::new(map);
                tracing::debug!(partitions = count, "partition cache rebuilt");
                count
            }
            Err(e) => {
                tracing::error!(error = %e, "partition scan task failed, keeping previous cache");
                self.entries.read().await.len()
            }
        }
    }

    pub async fn lookup(&self, identity: &str) -> Option<PartitionDescriptor> {
        self.entries.read().await.get(identity).cloned()
    }

    pub async fn contains(&self, identity: &str) -> bool {
        self.entries.read().await.contains_key(identity)
    }

    pub async fn list_by_device(&self, device: u32) -> Vec<PartitionDescriptor> {
        let entries = self.entries.read().await.clone();
        let mut list: Vec<_> = entries
            .values()
            .filter(|d| d.device_index == device)
            .cloned()
            .collect();
        list.sort_by_key(|d| d.instance_id);
        list
    }

    pub async fn list_all(&self) -> Vec<PartitionDescriptor> {
        let entries = self.entries.read().await.clone();
        let mut list: Vec<_> = entries.values().cloned().collect();
        list.sort_by_key(|d| (d.device_index, d.instance_id));
        list
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

/// Blocking enumeration of every partition on every enabled device.
///
/// Failures are contained to the device or instance they occur on.
pub fn scan_partitions(driver: &dyn PartitionDriver) -> HashMap<Identity, PartitionDescriptor> {
    let mut map = HashMap::new();

    let device_count = match driver.device_count() {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(error = %e, "failed to count devices during partition scan");
            return map;
        }
    };

    for device in 0..device_count {
        match driver.partition_mode(device) {
            Ok(mode) if mode.is_enabled() => {}
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(device, error = %e, "skipping device, partition mode unavailable");
                continue;
            }
        }

        let instances = match driver.partition_instances(device) {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(device, error = %e, "skipping device, instance enumeration failed");
                continue;
            }
        };

        for instance_id in instances {
            let Some(descriptor) = describe(driver, device, instance_id) else {
                continue;
            };
            if let Some(existing) = map.get(&descriptor.identity) {
                tracing::warn!(
                    identity = %descriptor.identity,
                    device,
                    instance_id,
                    first_device = existing.device_index,
                    first_instance = existing.instance_id,
                    "duplicate partition identity, keeping the first"
                );
                continue;
            }
            map.insert(descriptor.identity.clone(), descriptor);
        }
    }

    map
}

fn describe(
    driver: &dyn PartitionDriver,
    device: u32,
    instance_id: u32,
) -> Option<PartitionDescriptor> {
    let info = match driver.partition_info(device, instance_id) {
        Ok(info) => info,
        Err(e) => {
            tracing::warn!(device, instance_id, error = %e, "skipping partition");
            return None;
        }
    };
    if info.identity.is_empty() {
        tracing::debug!(device, instance_id, "partition has no identity yet");
        return None;
    }

    let mut sub_partitions = driver
        .sub_partitions(device, instance_id)
        .unwrap_or_else(|e| {
            tracing::warn!(device, instance_id, error = %e, "failed to list sub-partitions");
            Vec::new()
        });
    sub_partitions.sort_by_key(|s| s.id);

    Some(PartitionDescriptor {
        device_index: device,
        instance_id,
        profile_id: info.profile_id,
        identity: info.identity,
        memory_total: info.memory_total,
        compute_units: info.compute_units,
        max_sub_partitions: info.max_sub_partitions,
        sub_partitions,
    })
}
