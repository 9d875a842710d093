//! Saved partition layouts.
//!
//! A layout records which partitions each device should carry, without any
//! instance ids or identities, so it can be re-applied after a reboot or on
//! another host with the same hardware.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::cache::PartitionDescriptor;
use crate::error::ManagerError;
use crate::error::Result;

/// One partition to create, with the profiles of its sub-partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionLayout {
    pub profile_id: u32,
    /// Sorted
    #[serde(default)]
    pub sub_partition_profiles: Vec<u32>,
}

impl PartitionLayout {
    pub fn new(profile_id: u32, mut sub_partition_profiles: Vec<u32>) -> Self {
        sub_partition_profiles.sort_unstable();
        Self {
            profile_id,
            sub_partition_profiles,
        }
    }

    fn from_descriptor(partition: &PartitionDescriptor) -> Self {
        Self::new(
            partition.profile_id,
            partition.sub_partitions.iter().map(|s| s.profile_id).collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLayout {
    pub index: u32,
    pub partitions: Vec<PartitionLayout>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutSnapshot {
    pub devices: Vec<DeviceLayout>,
}

/// Work needed to bring one device in line with a layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayoutDiff {
    pub to_create: Vec<PartitionLayout>,
    /// Instance ids currently on the device.
    pub to_destroy: Vec<u32>,
}

impl LayoutDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_destroy.is_empty()
    }
}

impl LayoutSnapshot {
    /// Groups partitions by device, in device and instance order.
    pub fn from_descriptors(partitions: &[PartitionDescriptor]) -> Self {
        let mut by_device: BTreeMap<u32, Vec<&PartitionDescriptor>> = BTreeMap::new();
        for partition in partitions {
            by_device.entry(partition.device_index).or_default().push(partition);
        }

        let devices = by_device
            .into_iter()
            .map(|(index, mut partitions)| {
                partitions.sort_by_key(|p| p.instance_id);
                DeviceLayout {
                    index,
                    partitions: partitions
                        .into_iter()
                        .map(PartitionLayout::from_descriptor)
                        .collect(),
                }
            })
            .collect();

        Self { devices }
    }

    pub fn device(&self, index: u32) -> Option<&DeviceLayout> {
        self.devices.iter().find(|d| d.index == index)
    }

    /// Compares the layout for `device` against what is on it now.
    ///
    /// Entries are matched as a multiset, so partitions that already exist
    /// with the right profile and sub-partitions are left alone. A device
    /// missing from the layout yields an empty diff.
    pub fn diff(&self, device: u32, current: &[PartitionDescriptor]) -> LayoutDiff {
        let Some(wanted) = self.device(device) else {
            return LayoutDiff::default();
        };

        let mut wanted_counts: BTreeMap<PartitionLayout, usize> = BTreeMap::new();
        for entry in &wanted.partitions {
            let entry = PartitionLayout::new(entry.profile_id, entry.sub_partition_profiles.clone());
            *wanted_counts.entry(entry).or_default() += 1;
        }

        let mut present: Vec<&PartitionDescriptor> =
            current.iter().filter(|p| p.device_index == device).collect();
        present.sort_by_key(|p| p.instance_id);

        let mut to_destroy = Vec::new();
        for partition in present {
            match wanted_counts.get_mut(&PartitionLayout::from_descriptor(partition)) {
                Some(count) if *count > 0 => *count -= 1,
                _ => to_destroy.push(partition.instance_id),
            }
        }

        let to_create = wanted_counts
            .into_iter()
            .flat_map(|(entry, count)| std::iter::repeat(entry).take(count))
            .collect();

        LayoutDiff {
            to_create,
            to_destroy,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for device in &self.devices {
            if !seen.insert(device.index) {
                return Err(ManagerError::Layout(format!(
                    "device {} listed more than once",
                    device.index
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json)?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        tokio::fs::write(path, self.to_json()?).await?;
        tracing::info!(path = %path.display(), devices = self.devices.len(), "layout saved");
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await?;
        let snapshot = Self::from_json(&content)?;
        tracing::info!(path = %path.display(), devices = snapshot.devices.len(), "layout loaded");
        Ok(snapshot)
    }
}
