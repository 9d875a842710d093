//! Error types shared by the driver layer and the manager facade.

use std::borrow::Cow;
use std::time::Duration;

use nvml_wrapper::error::NvmlError;
use thiserror::Error;

/// A driver call that returned a non-success code.
///
/// Carries the name of the operation that failed and the driver's own error
/// text, so callers can report both without knowing which backend produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{operation} failed: {message}")]
pub struct DriverError {
    pub operation: Cow<'static, str>,
    pub message: String,
}

impl DriverError {
    pub fn new(operation: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub(crate) fn nvml(operation: impl Into<Cow<'static, str>>, err: NvmlError) -> Self {
        Self::new(operation, err.to_string())
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors surfaced by [`crate::PartitionManager`].
///
/// Only [`ManagerError::Initialization`] and [`ManagerError::NoDevices`] are
/// fatal; everything else is returned to the caller of a single operation.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("invalid device index {index} ({count} devices present)")]
    InvalidDeviceIndex { index: u32, count: u32 },

    #[error("unknown profile {profile_id} for device {device}")]
    UnknownProfile { device: u32, profile_id: u32 },

    #[error("invalid refresh interval {0:?}")]
    InvalidInterval(Duration),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("driver initialization failed: {0}")]
    Initialization(String),

    #[error("no physical devices found")]
    NoDevices,

    #[error("mutation queue is full")]
    QueueFull,

    #[error("mutation worker is not running")]
    WorkerStopped,

    #[error("task `{0}` panicked")]
    TaskPanicked(String),

    #[error("invalid layout: {0}")]
    Layout(String),

    #[error("layout serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ManagerError {
    /// True for argument errors detected before any driver call.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::InvalidDeviceIndex { .. } | Self::UnknownProfile { .. } | Self::InvalidInterval(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
