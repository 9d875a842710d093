//! GPU partition management.
//!
//! [`PartitionManager`] discovers partition-capable devices, keeps an
//! identity-keyed cache of their partition instances, samples per-partition
//! telemetry in the background and serializes every topology change through
//! a single mutation worker.

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod layout;
pub mod manager;
pub mod monitor;
pub mod telemetry;
pub mod worker;

pub use cache::PartitionDescriptor;
pub use config::ManagerConfig;
pub use driver::PartitionDriver;
pub use driver::PartitionMode;
pub use error::DriverError;
pub use error::ManagerError;
pub use layout::LayoutSnapshot;
pub use manager::PartitionManager;
pub use manager::PhysicalDevice;
pub use telemetry::TelemetrySample;
pub use worker::MutationOutcome;
pub use worker::MutationReport;
pub use worker::MutationTicket;
