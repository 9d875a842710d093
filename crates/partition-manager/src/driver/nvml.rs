//! NVML-backed driver.
//!
//! Plain device reads go through the safe `nvml-wrapper` API. MIG
//! enumeration and mutation are not covered there, so those calls are made
//! against the raw symbol table from `nvml-wrapper-sys`, loaded from the same
//! shared object.

use std::ffi::OsStr;
use std::mem;
use std::ptr;

use nvml_wrapper::enum_wrappers::device::TemperatureSensor;
use nvml_wrapper::enums::device::UsedGpuMemory;
use nvml_wrapper::error::nvml_try;
use nvml_wrapper::Device;
use nvml_wrapper::Nvml;
use nvml_wrapper_sys::bindings::nvmlComputeInstanceInfo_t;
use nvml_wrapper_sys::bindings::nvmlComputeInstanceProfileInfo_t;
use nvml_wrapper_sys::bindings::nvmlComputeInstance_t;
use nvml_wrapper_sys::bindings::nvmlDevice_t;
use nvml_wrapper_sys::bindings::nvmlGpuInstanceInfo_t;
use nvml_wrapper_sys::bindings::nvmlGpuInstanceProfileInfo_t;
use nvml_wrapper_sys::bindings::nvmlGpuInstance_t;
use nvml_wrapper_sys::bindings::nvmlReturn_enum_NVML_SUCCESS as NVML_SUCCESS;
use nvml_wrapper_sys::bindings::nvmlReturn_t;
use nvml_wrapper_sys::bindings::NvmlLib;
use nvml_wrapper_sys::bindings::NVML_COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED;
use nvml_wrapper_sys::bindings::NVML_COMPUTE_INSTANCE_PROFILE_COUNT;
use nvml_wrapper_sys::bindings::NVML_DEVICE_MIG_DISABLE;
use nvml_wrapper_sys::bindings::NVML_DEVICE_MIG_ENABLE;
use nvml_wrapper_sys::bindings::NVML_GPU_INSTANCE_PROFILE_COUNT;

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

const DEFAULT_LIB: &str = "libnvidia-ml.so.1";
const PROCESS_NAME_LEN: usize = 256;
const MAX_INSTANCES_PER_PROFILE: usize = 8;
const MIB: u64 = 1024 * 1024;

/// Calls a raw NVML symbol and converts the return code.
macro_rules! raw {
    ($lib:expr, $op:expr, $sym:ident($($arg:expr),* $(,)?)) => {{
        let f = $lib.$sym.as_ref().map_err(|e| {
            DriverError::new($op, format!("symbol {} unavailable: {e}", stringify!($sym)))
        })?;
        nvml_try(unsafe { (*f)($($arg),*) }).map_err(|e| DriverError::nvml($op, e))
    }};
}

pub struct NvmlDriver {
    nvml: Nvml,
    lib: NvmlLib,
}

// Raw handles are only dereferenced by the driver library, which is
// thread-safe for the calls made here.
unsafe impl Send for NvmlDriver {}
unsafe impl Sync for NvmlDriver {}

impl NvmlDriver {
    /// Initializes NVML, falling back to an explicit library path when the
    /// default lookup fails.
    pub fn init(lib_path: Option<&OsStr>) -> DriverResult<Self> {
        let path = lib_path.unwrap_or(OsStr::new(DEFAULT_LIB));
        let nvml = match lib_path {
            Some(path) => Nvml::builder().lib_path(path).init(),
            None => Nvml::init().or_else(|e| {
                tracing::warn!(error = %e, "standard NVML init failed, trying explicit library path");
                Nvml::builder().lib_path(path).init()
            }),
        }
        .map_err(|e| DriverError::nvml("nvml init", e))?;

        let lib = unsafe { NvmlLib::new(path) }
            .map_err(|e| DriverError::new("nvml load", e.to_string()))?;

        tracing::info!("NVML initialized");
        Ok(Self { nvml, lib })
    }

    fn device(&self, operation: &'static str, index: u32) -> DriverResult<Device<'_>> {
        self.nvml
            .device_by_index(index)
            .map_err(|e| DriverError::nvml(operation, e))
    }

    fn handle(&self, operation: &'static str, index: u32) -> DriverResult<nvmlDevice_t> {
        let device = self.device(operation, index)?;
        Ok(unsafe { device.handle() })
    }

    fn gpu_instance(
        &self,
        operation: &'static str,
        device: u32,
        instance_id: u32,
    ) -> DriverResult<nvmlGpuInstance_t> {
        let handle = self.handle(operation, device)?;
        let mut instance: nvmlGpuInstance_t = ptr::null_mut();
        raw!(
            self.lib,
            operation,
            nvmlDeviceGetGpuInstanceById(handle, instance_id, &mut instance)
        )?;
        Ok(instance)
    }

    /// Every compute instance inside a GPU instance, across all
    /// compute-instance profiles.
    fn compute_instances(
        &self,
        operation: &'static str,
        instance: nvmlGpuInstance_t,
    ) -> DriverResult<Vec<nvmlComputeInstance_t>> {
        let mut found = Vec::new();
        for index in 0..NVML_COMPUTE_INSTANCE_PROFILE_COUNT {
            let Some(profile) = self.compute_profile(instance, index) else {
                continue;
            };
            let mut buf: [nvmlComputeInstance_t; MAX_INSTANCES_PER_PROFILE] =
                [ptr::null_mut(); MAX_INSTANCES_PER_PROFILE];
            let mut count = 0;
            raw!(
                self.lib,
                operation,
                nvmlGpuInstanceGetComputeInstances(
                    instance,
                    profile.id,
                    buf.as_mut_ptr(),
                    &mut count
                )
            )?;
            found.extend_from_slice(&buf[..(count as usize).min(MAX_INSTANCES_PER_PROFILE)]);
        }
        Ok(found)
    }

    /// `None` when the profile slot is not supported by this instance.
    fn compute_profile(
        &self,
        instance: nvmlGpuInstance_t,
        index: u32,
    ) -> Option<nvmlComputeInstanceProfileInfo_t> {
        let f = self.lib.nvmlGpuInstanceGetComputeInstanceProfileInfo.as_ref().ok()?;
        let mut info: nvmlComputeInstanceProfileInfo_t = unsafe { mem::zeroed() };
        let code = unsafe {
            (*f)(
                instance,
                index,
                NVML_COMPUTE_INSTANCE_ENGINE_PROFILE_SHARED,
                &mut info,
            )
        };
        (code == NVML_SUCCESS).then_some(info)
    }

    /// `None` when the profile slot is not supported by this device.
    fn gpu_profile(
        &self,
        handle: nvmlDevice_t,
        index: u32,
    ) -> Option<nvmlGpuInstanceProfileInfo_t> {
        let f = self.lib.nvmlDeviceGetGpuInstanceProfileInfo.as_ref().ok()?;
        let mut info: nvmlGpuInstanceProfileInfo_t = unsafe { mem::zeroed() };
        let code: nvmlReturn_t = unsafe { (*f)(handle, index, &mut info) };
        (code == NVML_SUCCESS).then_some(info)
    }

    fn gpu_profile_by_id(
        &self,
        handle: nvmlDevice_t,
        profile_id: u32,
    ) -> Option<nvmlGpuInstanceProfileInfo_t> {
        (0..NVML_GPU_INSTANCE_PROFILE_COUNT)
            .filter_map(|index| self.gpu_profile(handle, index))
            .find(|info| info.id == profile_id)
    }

    /// The MIG device handle backing a GPU instance. Telemetry and identity
    /// are only reported through this handle.
    fn mig_device(
        &self,
        operation: &'static str,
        device: u32,
        instance_id: u32,
    ) -> DriverResult<Option<Device<'_>>> {
        let handle = self.handle(operation, device)?;
        let mut max = 0;
        raw!(self.lib, operation, nvmlDeviceGetMaxMigDeviceCount(handle, &mut max))?;

        for index in 0..max {
            let mut mig: nvmlDevice_t = ptr::null_mut();
            if raw!(
                self.lib,
                operation,
                nvmlDeviceGetMigDeviceHandleByIndex(handle, index, &mut mig)
            )
            .is_err()
            {
                continue;
            }
            let mut gi_id = 0;
            raw!(self.lib, operation, nvmlDeviceGetGpuInstanceId(mig, &mut gi_id))?;
            if gi_id == instance_id {
                return Ok(Some(unsafe { Device::new(mig, &self.nvml) }));
            }
        }
        Ok(None)
    }

    fn require_mig_device(
        &self,
        operation: &'static str,
        device: u32,
        instance_id: u32,
    ) -> DriverResult<Device<'_>> {
        self.mig_device(operation, device, instance_id)?
            .ok_or_else(|| DriverError::new(operation, "Not Found"))
    }
}

impl PartitionDriver for NvmlDriver {
    fn device_count(&self) -> DriverResult<u32> {
        self.nvml
            .device_count()
            .map_err(|e| DriverError::nvml("device count", e))
    }

    fn device_name(&self, device: u32) -> DriverResult<String> {
        self.device("device name", device)?
            .name()
            .map_err(|e| DriverError::nvml("device name", e))
    }

    fn device_uuid(&self, device: u32) -> DriverResult<String> {
        self.device("device uuid", device)?
            .uuid()
            .map_err(|e| DriverError::nvml("device uuid", e))
    }

    fn partition_mode(&self, device: u32) -> DriverResult<PartitionMode> {
        let handle = self.handle("partition mode", device)?;
        let mut current = 0;
        let mut pending = 0;
        raw!(
            self.lib,
            "partition mode",
            nvmlDeviceGetMigMode(handle, &mut current, &mut pending)
        )?;
        Ok(PartitionMode::from(current == NVML_DEVICE_MIG_ENABLE))
    }

    fn set_partition_mode(&self, device: u32, mode: PartitionMode) -> DriverResult<()> {
        let handle = self.handle("set partition mode", device)?;
        let raw_mode = if mode.is_enabled() {
            NVML_DEVICE_MIG_ENABLE
        } else {
            NVML_DEVICE_MIG_DISABLE
        };
        let mut activation: nvmlReturn_t = NVML_SUCCESS;
        raw!(
            self.lib,
            "set partition mode",
            nvmlDeviceSetMigMode(handle, raw_mode, &mut activation)
        )?;
        nvml_try(activation).map_err(|e| DriverError::nvml("activate partition mode", e))
    }

    fn partition_instances(&self, device: u32) -> DriverResult<Vec<u32>> {
        let handle = self.handle("partition instances", device)?;
        let mut ids = Vec::new();
        for index in 0..NVML_GPU_INSTANCE_PROFILE_COUNT {
            let Some(profile) = self.gpu_profile(handle, index) else {
                continue;
            };
            let mut buf: [nvmlGpuInstance_t; MAX_INSTANCES_PER_PROFILE] =
                [ptr::null_mut(); MAX_INSTANCES_PER_PROFILE];
            let mut count = 0;
            raw!(
                self.lib,
                "partition instances",
                nvmlDeviceGetGpuInstances(handle, profile.id, buf.as_mut_ptr(), &mut count)
            )?;
            for instance in &buf[..(count as usize).min(MAX_INSTANCES_PER_PROFILE)] {
                let mut info: nvmlGpuInstanceInfo_t = unsafe { mem::zeroed() };
                raw!(
                    self.lib,
                    "partition instances",
                    nvmlGpuInstanceGetInfo(*instance, &mut info)
                )?;
                ids.push(info.id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn partition_info(&self, device: u32, instance_id: u32) -> DriverResult<PartitionInfo> {
        let handle = self.handle("partition info", device)?;
        let instance = self.gpu_instance("partition info", device, instance_id)?;
        let mut info: nvmlGpuInstanceInfo_t = unsafe { mem::zeroed() };
        raw!(self.lib, "partition info", nvmlGpuInstanceGetInfo(instance, &mut info))?;

        let profile = self
            .gpu_profile_by_id(handle, info.profileId)
            .ok_or_else(|| DriverError::new("partition info", "Not Supported"))?;

        // Instances without a compute instance have no MIG device yet.
        let identity = match self.mig_device("partition info", device, instance_id)? {
            Some(mig) => mig
                .uuid()
                .map_err(|e| DriverError::nvml("partition identity", e))?,
            None => String::new(),
        };

        Ok(PartitionInfo {
            profile_id: info.profileId,
            identity,
            memory_total: profile.memorySizeMB * MIB,
            compute_units: profile.multiprocessorCount,
            max_sub_partitions: profile.sliceCount,
        })
    }

    fn sub_partitions(&self, device: u32, instance_id: u32) -> DriverResult<Vec<SubPartition>> {
        let instance = self.gpu_instance("sub partitions", device, instance_id)?;
        let mut subs = self
            .compute_instances("sub partitions", instance)?
            .into_iter()
            .map(|ci| -> DriverResult<SubPartition> {
                let mut info: nvmlComputeInstanceInfo_t = unsafe { mem::zeroed() };
                raw!(self.lib, "sub partitions", nvmlComputeInstanceGetInfo_v2(ci, &mut info))?;
                Ok(SubPartition {
                    id: info.id,
                    profile_id: info.profileId,
                })
            })
            .collect::<DriverResult<Vec<_>>>()?;
        subs.sort_unstable();
        Ok(subs)
    }

    fn partition_utilization(&self, device: u32, instance_id: u32) -> DriverResult<Utilization> {
        let rates = self
            .require_mig_device("partition utilization", device, instance_id)?
            .utilization_rates()
            .map_err(|e| DriverError::nvml("partition utilization", e))?;
        Ok(Utilization {
            compute: rates.gpu,
            memory: rates.memory,
        })
    }

    fn partition_memory(&self, device: u32, instance_id: u32) -> DriverResult<MemoryUsage> {
        let memory = self
            .require_mig_device("partition memory", device, instance_id)?
            .memory_info()
            .map_err(|e| DriverError::nvml("partition memory", e))?;
        Ok(MemoryUsage {
            used: memory.used,
            free: memory.free,
            total: memory.total,
        })
    }

    fn power_usage(&self, device: u32) -> DriverResult<u32> {
        self.device("power usage", device)?
            .power_usage()
            .map_err(|e| DriverError::nvml("power usage", e))
    }

    fn temperature(&self, device: u32) -> DriverResult<u32> {
        self.device("temperature", device)?
            .temperature(TemperatureSensor::Gpu)
            .map_err(|e| DriverError::nvml("temperature", e))
    }

    fn partition_processes(
        &self,
        device: u32,
        instance_id: u32,
    ) -> DriverResult<Vec<ProcessUsage>> {
        let processes = self
            .require_mig_device("partition processes", device, instance_id)?
            .running_compute_processes()
            .map_err(|e| DriverError::nvml("partition processes", e))?;
        Ok(processes
            .into_iter()
            .map(|p| ProcessUsage {
                pid: p.pid,
                used_memory: match p.used_gpu_memory {
                    UsedGpuMemory::Used(bytes) => bytes,
                    UsedGpuMemory::Unavailable => 0,
                },
            })
            .collect())
    }

    fn process_name(&self, pid: u32) -> DriverResult<String> {
        self.nvml
            .sys_process_name(pid, PROCESS_NAME_LEN)
            .map_err(|e| DriverError::nvml("process name", e))
    }

    fn available_profiles(&self, device: u32) -> DriverResult<Vec<PartitionProfile>> {
        let name = self.device_name(device)?;
        let handle = self.handle("available profiles", device)?;
        let mut profiles = Vec::new();
        for index in 0..NVML_GPU_INSTANCE_PROFILE_COUNT {
            let Some(info) = self.gpu_profile(handle, index) else {
                continue;
            };
            let mut remaining = 0;
            raw!(
                self.lib,
                "available profiles",
                nvmlDeviceGetGpuInstanceRemainingCapacity(handle, info.id, &mut remaining)
            )?;
            profiles.push(PartitionProfile {
                profile_id: info.id,
                memory_size_mib: info.memorySizeMB,
                compute_units: info.multiprocessorCount,
                max_sub_partitions: info.sliceCount,
                remaining_capacity: remaining,
                name: format!("{name}_Profile_{}", info.id),
            });
        }
        Ok(profiles)
    }

    fn create_instance(&self, device: u32, profile_id: u32) -> DriverResult<u32> {
        let handle = self.handle("create instance", device)?;
        let mut instance: nvmlGpuInstance_t = ptr::null_mut();
        raw!(
            self.lib,
            "create instance",
            nvmlDeviceCreateGpuInstance(handle, profile_id, &mut instance)
        )?;
        let mut info: nvmlGpuInstanceInfo_t = unsafe { mem::zeroed() };
        raw!(self.lib, "create instance", nvmlGpuInstanceGetInfo(instance, &mut info))?;
        Ok(info.id)
    }

    fn destroy_instance(&self, device: u32, instance_id: u32) -> DriverResult<()> {
        let instance = self.gpu_instance("destroy instance", device, instance_id)?;
        for ci in self.compute_instances("destroy instance", instance)? {
            raw!(self.lib, "destroy sub-partition", nvmlComputeInstanceDestroy(ci))?;
        }
        raw!(self.lib, "destroy instance", nvmlGpuInstanceDestroy(instance))
    }

    fn create_sub_partition(
        &self,
        device: u32,
        instance_id: u32,
        profile_id: u32,
    ) -> DriverResult<u32> {
        let instance = self.gpu_instance("create sub-partition", device, instance_id)?;
        let profile = self
            .compute_profile(instance, profile_id)
            .ok_or_else(|| DriverError::new("create sub-partition", "Not Supported"))?;
        let mut ci: nvmlComputeInstance_t = ptr::null_mut();
        raw!(
            self.lib,
            "create sub-partition",
            nvmlGpuInstanceCreateComputeInstance(instance, profile.id, &mut ci)
        )?;
        let mut info: nvmlComputeInstanceInfo_t = unsafe { mem::zeroed() };
        raw!(
            self.lib,
            "create sub-partition",
            nvmlComputeInstanceGetInfo_v2(ci, &mut info)
        )?;
        Ok(info.id)
    }
}
