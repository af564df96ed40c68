//! Distributed Launcher Module
//!
//! Starts one training worker per device and supervises the group until every
//! worker has exited.

pub mod command;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod logger;
pub mod process_manager;
pub mod run_id;
pub mod supervisor;

pub use command::CommandTemplate;
pub use config::{DistributeArgs, LaunchConfig};
pub use device::{
    count_masked_devices, resolve, DeviceCountQuery, DeviceSet, VisibleDeviceCount,
    VISIBLE_DEVICES_VAR,
};
#[cfg(feature = "nvml")]
pub use device::NvmlDeviceCount;
pub use env::{BaseEnv, EnvKeys, EnvMap, WorkerEnvBuilder};
pub use error::{LaunchError, Result};
pub use logger::AggregateLogger;
pub use run_id::RunId;
pub use supervisor::{GroupResult, ProcessGroupSupervisor, WorkerOutcome, WorkerSpec};
