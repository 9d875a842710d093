//! In-memory driver used by tests and dry runs.
//!
//! Models a set of partition-capable devices with the A100 40GB profile
//! table, records every call it receives, and lets tests inject failures and
//! slow mutations.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use super::MemoryUsage;
use super::PartitionDriver;
use super::PartitionInfo;
use super::PartitionMode;
use super::PartitionProfile;
use super::ProcessUsage;
use super::SubPartition;
use super::Utilization;
use crate::error::DriverError;
use crate::error::DriverResult;

const MIB: u64 = 1024 * 1024;

/// (profile id, name, memory MiB, compute units, max sub-partitions, max instances)
const A100_PROFILES: [(u32, &str, u64, u32, u32, u32); 5] = [
    (19, "1g.5gb", 4864, 14, 1, 7),
    (14, "2g.10gb", 9856, 28, 2, 3),
    (9, "3g.20gb", 19968, 42, 3, 2),
    (5, "4g.20gb", 19968, 56, 4, 1),
    (0, "7g.40gb", 40192, 98, 7, 1),
];

#[derive(Debug, Clone)]
struct MockProfile {
    profile_id: u32,
    name: &'static str,
    memory_mib: u64,
    compute_units: u32,
    max_sub_partitions: u32,
    max_instances: u32,
}

#[derive(Debug, Clone)]
struct MockInstance {
    profile_id: u32,
    identity: String,
    sub_partitions: BTreeMap<u32, u32>,
    utilization: Utilization,
    processes: Vec<ProcessUsage>,
}

#[derive(Debug, Clone)]
struct MockDevice {
    name: String,
    uuid: String,
    mode: PartitionMode,
    instances: BTreeMap<u32, MockInstance>,
    next_instance_id: u32,
    failing: bool,
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    profiles: Vec<MockProfile>,
    process_names: HashMap<u32, String>,
    failing_instances: HashSet<(u32, u32)>,
    fail_device_count: bool,
    mutation_failure: Option<String>,
    mutation_delay: Duration,
    identity_seq: u64,
    calls: Vec<String>,
    mutations: Vec<String>,
}

/// Driver double backed by plain data behind a mutex.
#[derive(Debug)]
pub struct MockDriver {
    state: Mutex<MockState>,
    active_mutations: AtomicUsize,
    max_concurrent_mutations: AtomicUsize,
}

impl MockDriver {
    /// Creates `device_count` devices with partition mode disabled.
    pub fn new(device_count: u32) -> Self {
        let devices = (0..device_count)
            .map(|index| MockDevice {
                name: "NVIDIA A100-SXM4-40GB".to_string(),
                uuid: format!("GPU-00000000-0000-0000-0000-{index:012x}"),
                mode: PartitionMode::Disabled,
                instances: BTreeMap::new(),
                next_instance_id: 1,
                failing: false,
            })
            .collect();
        let profiles = A100_PROFILES
            .iter()
            .map(
                |&(profile_id, name, memory_mib, compute_units, max_sub_partitions, max_instances)| {
                    MockProfile {
                        profile_id,
                        name,
                        memory_mib,
                        compute_units,
                        max_sub_partitions,
                        max_instances,
                    }
                },
            )
            .collect();

        Self {
            state: Mutex::new(MockState {
                devices,
                profiles,
                ..Default::default()
            }),
            active_mutations: AtomicUsize::new(0),
            max_concurrent_mutations: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the mode directly, without recording a call.
    pub fn set_mode(&self, device: u32, mode: PartitionMode) {
        if let Some(dev) = self.state().devices.get_mut(device as usize) {
            dev.mode = mode;
        }
    }

    /// Creates an instance directly, without recording a call. Returns
    /// `(instance_id, identity)`.
    pub fn insert_instance(&self, device: u32, profile_id: u32) -> Option<(u32, String)> {
        let mut state = self.state();
        let seq = next_seq(&mut state);
        let dev = state.devices.get_mut(device as usize)?;
        let instance_id = dev.next_instance_id;
        dev.next_instance_id += 1;
        let identity = identity_for(device, instance_id, seq);
        dev.instances.insert(
            instance_id,
            MockInstance {
                profile_id,
                identity: identity.clone(),
                sub_partitions: BTreeMap::new(),
                utilization: Utilization::default(),
                processes: Vec::new(),
            },
        );
        Some((instance_id, identity))
    }

    /// Adds a sub-partition directly, without recording a call.
    pub fn insert_sub_partition(&self, device: u32, instance_id: u32, profile_id: u32) -> Option<u32> {
        let mut state = self.state();
        let instance = state
            .devices
            .get_mut(device as usize)?
            .instances
            .get_mut(&instance_id)?;
        let id = instance.sub_partitions.keys().next_back().map_or(0, |id| id + 1);
        instance.sub_partitions.insert(id, profile_id);
        Some(id)
    }

    /// Makes the instance report an empty identity.
    pub fn blank_identity(&self, device: u32, instance_id: u32) {
        if let Some(instance) = self.instance_mut(&mut self.state(), device, instance_id) {
            instance.identity.clear();
        }
    }

    /// Every read against the device fails while set.
    pub fn fail_device(&self, device: u32, failing: bool) {
        if let Some(dev) = self.state().devices.get_mut(device as usize) {
            dev.failing = failing;
        }
    }

    /// `partition_info` for this instance fails while set.
    pub fn fail_instance(&self, device: u32, instance_id: u32, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_instances.insert((device, instance_id));
        } else {
            state.failing_instances.remove(&(device, instance_id));
        }
    }

    pub fn fail_device_count(&self, failing: bool) {
        self.state().fail_device_count = failing;
    }

    /// Every mutating call fails with `message` while set.
    pub fn fail_mutations(&self, message: Option<&str>) {
        self.state().mutation_failure = message.map(str::to_string);
    }

    /// Each mutating call sleeps this long before touching state.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.state().mutation_delay = delay;
    }

    pub fn set_utilization(&self, device: u32, instance_id: u32, compute: u32, memory: u32) {
        if let Some(instance) = self.instance_mut(&mut self.state(), device, instance_id) {
            instance.utilization = Utilization { compute, memory };
        }
    }

    /// Attaches a process to the instance. `name` of `None` makes the name
    /// lookup fail.
    pub fn add_process(
        &self,
        device: u32,
        instance_id: u32,
        pid: u32,
        name: Option<&str>,
        used_memory: u64,
    ) {
        let mut state = self.state();
        if let Some(name) = name {
            state.process_names.insert(pid, name.to_string());
        }
        if let Some(instance) = self.instance_mut(&mut state, device, instance_id) {
            instance.processes.push(ProcessUsage { pid, used_memory });
        }
    }

    /// Names of driver calls received so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Completed mutations in execution order.
    pub fn mutation_log(&self) -> Vec<String> {
        self.state().mutations.clone()
    }

    /// Highest number of mutating calls observed running at once.
    pub fn max_concurrent_mutations(&self) -> usize {
        self.max_concurrent_mutations.load(Ordering::SeqCst)
    }

    fn instance_mut<'a>(
        &self,
        state: &'a mut MockState,
        device: u32,
        instance_id: u32,
    ) -> Option<&'a mut MockInstance> {
        state
            .devices
            .get_mut(device as usize)?
            .instances
            .get_mut(&instance_id)
    }

    fn record(&self, call: String) -> MutexGuard<'_, MockState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    /// Records a read call and returns the state if the device is usable.
    fn read(&self, operation: &'static str, device: u32) -> DriverResult<MutexGuard<'_, MockState>> {
        let state = self.record(format!("{operation}({device})"));
        let failure = match state.devices.get(device as usize) {
            None => Some("Invalid Argument"),
            Some(dev) if dev.failing => Some("GPU is lost"),
            Some(_) => None,
        };
        match failure {
            Some(message) => Err(DriverError::new(operation, message)),
            None => Ok(state),
        }
    }

    /// Runs a mutation with the configured delay and concurrency tracking.
    fn mutate<T>(
        &self,
        operation: &'static str,
        call: String,
        apply: impl FnOnce(&mut MockState) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let delay = {
            let state = self.record(call.clone());
            state.mutation_delay
        };

        let active = self.active_mutations.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_mutations.fetch_max(active, Ordering::SeqCst);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let result = {
            let mut state = self.state();
            match state.mutation_failure.clone() {
                Some(message) => Err(DriverError::new(operation, message)),
                None => {
                    let result = apply(&mut *state);
                    if result.is_ok() {
                        state.mutations.push(call);
                    }
                    result
                }
            }
        };

        self.active_mutations.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

fn next_seq(state: &mut MockState) -> u64 {
    state.identity_seq += 1;
    state.identity_seq
}

fn identity_for(device: u32, instance_id: u32, seq: u64) -> String {
    format!("MIG-{device:08x}-{instance_id:04x}-{seq:04x}-0000-000000000000")
}

fn device_mut<'a>(
    state: &'a mut MockState,
    operation: &'static str,
    device: u32,
) -> DriverResult<&'a mut MockDevice> {
    match state.devices.get_mut(device as usize) {
        Some(dev) if dev.failing => Err(DriverError::new(operation, "GPU is lost")),
        Some(dev) => Ok(dev),
        None => Err(DriverError::new(operation, "Invalid Argument")),
    }
}

fn instance<'a>(
    state: &'a MockState,
    operation: &'static str,
    device: u32,
    instance_id: u32,
) -> DriverResult<&'a MockInstance> {
    state
        .devices
        .get(device as usize)
        .and_then(|dev| dev.instances.get(&instance_id))
        .ok_or_else(|| DriverError::new(operation, "Not Found"))
}

impl PartitionDriver for MockDriver {
    fn device_count(&self) -> DriverResult<u32> {
        let state = self.record("device_count".to_string());
        if state.fail_device_count {
            return Err(DriverError::new("device count", "Driver Not Loaded"));
        }
        Ok(state.devices.len() as u32)
    }

    fn device_name(&self, device: u32) -> DriverResult<String> {
        let state = self.read("device name", device)?;
        Ok(state.devices[device as usize].name.clone())
    }

    fn device_uuid(&self, device: u32) -> DriverResult<String> {
        let state = self.read("device uuid", device)?;
        Ok(state.devices[device as usize].uuid.clone())
    }

    fn partition_mode(&self, device: u32) -> DriverResult<PartitionMode> {
        let state = self.read("partition mode", device)?;
        Ok(state.devices[device as usize].mode)
    }

    fn set_partition_mode(&self, device: u32, mode: PartitionMode) -> DriverResult<()> {
        self.mutate(
            "set partition mode",
            format!("set_partition_mode({device}, {mode})"),
            |state| {
                let dev = device_mut(state, "set partition mode", device)?;
                dev.mode = mode;
                if !mode.is_enabled() {
                    dev.instances.clear();
                }
                Ok(())
            },
        )
    }

    fn partition_instances(&self, device: u32) -> DriverResult<Vec<u32>> {
        let state = self.read("partition instances", device)?;
        Ok(state.devices[device as usize].instances.keys().copied().collect())
    }

    fn partition_info(&self, device: u32, instance_id: u32) -> DriverResult<PartitionInfo> {
        let state = self.read("partition info", device)?;
        if state.failing_instances.contains(&(device, instance_id)) {
            return Err(DriverError::new("partition info", "Unknown Error"));
        }
        let instance = instance(&state, "partition info", device, instance_id)?;
        let profile = state
            .profiles
            .iter()
            .find(|p| p.profile_id == instance.profile_id)
            .ok_or_else(|| DriverError::new("partition info", "Not Supported"))?;
        Ok(PartitionInfo {
            profile_id: instance.profile_id,
            identity: instance.identity.clone(),
            memory_total: profile.memory_mib * MIB,
            compute_units: profile.compute_units,
            max_sub_partitions: profile.max_sub_partitions,
        })
    }

    fn sub_partitions(&self, device: u32, instance_id: u32) -> DriverResult<Vec<SubPartition>> {
        let state = self.read("sub partitions", device)?;
        let instance = instance(&state, "sub partitions", device, instance_id)?;
        Ok(instance
            .sub_partitions
            .iter()
            .map(|(&id, &profile_id)| SubPartition { id, profile_id })
            .collect())
    }

    fn partition_utilization(&self, device: u32, instance_id: u32) -> DriverResult<Utilization> {
        let state = self.read("partition utilization", device)?;
        Ok(instance(&state, "partition utilization", device, instance_id)?.utilization)
    }

    fn partition_memory(&self, device: u32, instance_id: u32) -> DriverResult<MemoryUsage> {
        let state = self.read("partition memory", device)?;
        let instance = instance(&state, "partition memory", device, instance_id)?;
        let total = state
            .profiles
            .iter()
            .find(|p| p.profile_id == instance.profile_id)
            .map_or(0, |p| p.memory_mib * MIB);
        let used: u64 = instance.processes.iter().map(|p| p.used_memory).sum();
        Ok(MemoryUsage {
            used,
            free: total.saturating_sub(used),
            total,
        })
    }

    fn power_usage(&self, device: u32) -> DriverResult<u32> {
        self.read("power usage", device)?;
        Ok(250_000 + device * 1_000)
    }

    fn temperature(&self, device: u32) -> DriverResult<u32> {
        self.read("temperature", device)?;
        Ok(40 + device)
    }

    fn partition_processes(
        &self,
        device: u32,
        instance_id: u32,
    ) -> DriverResult<Vec<ProcessUsage>> {
        let state = self.read("partition processes", device)?;
        Ok(instance(&state, "partition processes", device, instance_id)?
            .processes
            .clone())
    }

    fn process_name(&self, pid: u32) -> DriverResult<String> {
        let state = self.record(format!("process_name({pid})"));
        state
            .process_names
            .get(&pid)
            .cloned()
            .ok_or_else(|| DriverError::new("process name", "Not Found"))
    }

    fn available_profiles(&self, device: u32) -> DriverResult<Vec<PartitionProfile>> {
        let state = self.read("available profiles", device)?;
        let dev = &state.devices[device as usize];
        Ok(state
            .profiles
            .iter()
            .map(|p| {
                let used = dev
                    .instances
                    .values()
                    .filter(|i| i.profile_id == p.profile_id)
                    .count() as u32;
                PartitionProfile {
                    profile_id: p.profile_id,
                    memory_size_mib: p.memory_mib,
                    compute_units: p.compute_units,
                    max_sub_partitions: p.max_sub_partitions,
                    remaining_capacity: p.max_instances.saturating_sub(used),
                    name: format!("{}_Profile_{}", dev.name, p.profile_id),
                }
            })
            .collect())
    }

    fn create_instance(&self, device: u32, profile_id: u32) -> DriverResult<u32> {
        self.mutate(
            "create instance",
            format!("create_instance({device}, {profile_id})"),
            |state| {
                let max_instances = state
                    .profiles
                    .iter()
                    .find(|p| p.profile_id == profile_id)
                    .map(|p| p.max_instances)
                    .ok_or_else(|| DriverError::new("create instance", "Invalid Argument"))?;
                let seq = next_seq(state);
                let dev = device_mut(state, "create instance", device)?;
                if !dev.mode.is_enabled() {
                    return Err(DriverError::new("create instance", "Not Supported"));
                }
                let existing = dev
                    .instances
                    .values()
                    .filter(|i| i.profile_id == profile_id)
                    .count() as u32;
                if existing >= max_instances {
                    return Err(DriverError::new("create instance", "Insufficient Resources"));
                }
                let instance_id = dev.next_instance_id;
                dev.next_instance_id += 1;
                dev.instances.insert(
                    instance_id,
                    MockInstance {
                        profile_id,
                        identity: identity_for(device, instance_id, seq),
                        sub_partitions: BTreeMap::new(),
                        utilization: Utilization::default(),
                        processes: Vec::new(),
                    },
                );
                Ok(instance_id)
            },
        )
    }

    fn destroy_instance(&self, device: u32, instance_id: u32) -> DriverResult<()> {
        self.mutate(
            "destroy instance",
            format!("destroy_instance({device}, {instance_id})"),
            |state| {
                let dev = device_mut(state, "destroy instance", device)?;
                dev.instances
                    .remove(&instance_id)
                    .map(|_| ())
                    .ok_or_else(|| DriverError::new("destroy instance", "Not Found"))
            },
        )
    }

    fn create_sub_partition(
        &self,
        device: u32,
        instance_id: u32,
        profile_id: u32,
    ) -> DriverResult<u32> {
        self.mutate(
            "create sub-partition",
            format!("create_sub_partition({device}, {instance_id}, {profile_id})"),
            |state| {
                let max_sub_partitions = {
                    let instance = instance(state, "create sub-partition", device, instance_id)?;
                    state
                        .profiles
                        .iter()
                        .find(|p| p.profile_id == instance.profile_id)
                        .map_or(0, |p| p.max_sub_partitions)
                };
                let instance = device_mut(state, "create sub-partition", device)?
                    .instances
                    .get_mut(&instance_id)
                    .ok_or_else(|| DriverError::new("create sub-partition", "Not Found"))?;
                if instance.sub_partitions.len() as u32 >= max_sub_partitions {
                    return Err(DriverError::new(
                        "create sub-partition",
                        "Insufficient Resources",
                    ));
                }
                let id = instance.sub_partitions.keys().next_back().map_or(0, |id| id + 1);
                instance.sub_partitions.insert(id, profile_id);
                Ok(id)
            },
        )
    }
}
