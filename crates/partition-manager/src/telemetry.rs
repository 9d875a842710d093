use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::cache::PartitionDescriptor;
use crate::driver::PartitionDriver;

const MIB: u64 = 1024 * 1024;

/// One point-in-time reading for a partition.
///
/// Fields the driver could not report are left at zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub captured_at: DateTime<Utc>,
    /// Percent
    pub compute_utilization: u32,
    /// Percent
    pub memory_utilization: u32,
    /// Bytes
    pub memory_used: u64,
    pub memory_free: u64,
    pub memory_total: u64,
    /// Milliwatts, parent device
    pub power_usage: u32,
    /// Celsius, parent device
    pub temperature: u32,
    /// Process name to MiB in use.
    pub process_memory: BTreeMap<String, u64>,
}

/// Blocking, best-effort sample of one partition.
pub fn collect_sample(driver: &dyn PartitionDriver, partition: &PartitionDescriptor) -> TelemetrySample {
    let device = partition.device_index;
    let instance_id = partition.instance_id;
    let mut sample = TelemetrySample {
        captured_at: Utc::now(),
        ..Default::default()
    };

    match driver.partition_utilization(device, instance_id) {
        Ok(utilization) => {
            sample.compute_utilization = utilization.compute;
            sample.memory_utilization = utilization.memory;
        }
        Err(e) => tracing::debug!(identity = %partition.identity, error = %e, "utilization unavailable"),
    }

    match driver.partition_memory(device, instance_id) {
        Ok(memory) => {
            sample.memory_used = memory.used;
            sample.memory_free = memory.free;
            sample.memory_total = memory.total;
        }
        Err(e) => tracing::debug!(identity = %partition.identity, error = %e, "memory info unavailable"),
    }

    match driver.power_usage(device) {
        Ok(power) => sample.power_usage = power,
        Err(e) => tracing::debug!(device, error = %e, "power usage unavailable"),
    }

    match driver.temperature(device) {
        Ok(temperature) => sample.temperature = temperature,
        Err(e) => tracing::debug!(device, error = %e, "temperature unavailable"),
    }

    match driver.partition_processes(device, instance_id) {
        Ok(processes) => {
            for process in processes {
                let name = driver
                    .process_name(process.pid)
                    .unwrap_or_else(|_| format!("pid_{}", process.pid));
                *sample.process_memory.entry(name).or_default() += process.used_memory / MIB;
            }
        }
        Err(e) => tracing::debug!(identity = %partition.identity, error = %e, "process list unavailable"),
    }

    sample
}

/// Samples every partition, keyed by identity.
pub fn collect_samples(
    driver: &dyn PartitionDriver,
    partitions: &[PartitionDescriptor],
) -> HashMap<String, TelemetrySample> {
    partitions
        .iter()
        .map(|p| (p.identity.clone(), collect_sample(driver, p)))
        .collect()
}

/// Latest sample per identity, replaced as a whole by each refresh cycle.
#[derive(Debug, Default)]
pub struct TelemetryStore {
    samples: RwLock<Arc<HashMap<String, TelemetrySample>>>,
}

impl TelemetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, identity: &str) -> Option<TelemetrySample> {
        self.samples.read().await.get(identity).cloned()
    }

    pub async fn snapshot(&self) -> Arc<HashMap<String, TelemetrySample>> {
        self.samples.read().await.clone()
    }

    pub async fn replace(&self, samples: HashMap<String, TelemetrySample>) {
        *self.samples.write().await = Arc::new(samples);
    }

    pub async fn is_empty(&self) -> bool {
        self.samples.read().await.is_empty()
    }
}
