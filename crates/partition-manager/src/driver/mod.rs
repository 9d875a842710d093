//! Driver interface consumed by the manager.
//!
//! Every call is blocking and may hit the hardware. Implementations are not
//! required to tolerate concurrent mutating calls on the same device; the
//! manager guarantees at most one mutation in flight.

pub mod mock;
pub mod nvml;

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DriverResult;

pub use mock::MockDriver;
pub use nvml::NvmlDriver;

/// Per-device flag enabling hardware subdivision into partition instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionMode {
    Enabled,
    Disabled,
}

impl PartitionMode {
    pub fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl From<bool> for PartitionMode {
    fn from(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

impl fmt::Display for PartitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("enabled"),
            Self::Disabled => f.write_str("disabled"),
        }
    }
}

/// Fixed-size template a partition instance can be created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionProfile {
    pub profile_id: u32,
    pub memory_size_mib: u64,
    pub compute_units: u32,
    pub max_sub_partitions: u32,
    /// How many more instances of this profile the device can host.
    pub remaining_capacity: u32,
    pub name: String,
}

/// Static facts about one partition instance as reported by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    pub profile_id: u32,
    /// Globally unique identity; empty when the driver could not resolve one.
    pub identity: String,
    pub memory_total: u64,
    pub compute_units: u32,
    pub max_sub_partitions: u32,
}

/// A compute-instance subdivision of a partition instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubPartition {
    pub id: u32,
    pub profile_id: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Utilization {
    /// Percent
    pub compute: u32,
    /// Percent
    pub memory: u32,
}

/// Bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub used: u64,
    pub free: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUsage {
    pub pid: u32,
    /// Bytes
    pub used_memory: u64,
}

/// Blocking interface over the vendor device driver.
///
/// Devices are addressed by index, partition instances by
/// `(device, instance_id)`. Raw driver handles never cross this boundary
/// because they are not stable across rebuilds.
pub trait PartitionDriver: Send + Sync {
    fn device_count(&self) -> DriverResult<u32>;

    fn device_name(&self, device: u32) -> DriverResult<String>;

    fn device_uuid(&self, device: u32) -> DriverResult<String>;

    fn partition_mode(&self, device: u32) -> DriverResult<PartitionMode>;

    fn set_partition_mode(&self, device: u32, mode: PartitionMode) -> DriverResult<()>;

    /// Instance ids of every partition instance currently on the device.
    fn partition_instances(&self, device: u32) -> DriverResult<Vec<u32>>;

    fn partition_info(&self, device: u32, instance_id: u32) -> DriverResult<PartitionInfo>;

    fn sub_partitions(&self, device: u32, instance_id: u32) -> DriverResult<Vec<SubPartition>>;

    fn partition_utilization(&self, device: u32, instance_id: u32) -> DriverResult<Utilization>;

    fn partition_memory(&self, device: u32, instance_id: u32) -> DriverResult<MemoryUsage>;

    /// Milliwatts drawn by the physical device.
    fn power_usage(&self, device: u32) -> DriverResult<u32>;

    /// Degrees Celsius of the physical device.
    fn temperature(&self, device: u32) -> DriverResult<u32>;

    fn partition_processes(&self, device: u32, instance_id: u32)
        -> DriverResult<Vec<ProcessUsage>>;

    fn process_name(&self, pid: u32) -> DriverResult<String>;

    fn available_profiles(&self, device: u32) -> DriverResult<Vec<PartitionProfile>>;

    /// Returns the new instance id.
    fn create_instance(&self, device: u32, profile_id: u32) -> DriverResult<u32>;

    /// Tears down the instance's sub-partitions first.
    fn destroy_instance(&self, device: u32, instance_id: u32) -> DriverResult<()>;

    /// Returns the new sub-partition id.
    fn create_sub_partition(
        &self,
        device: u32,
        instance_id: u32,
        profile_id: u32,
    ) -> DriverResult<u32>;
}
