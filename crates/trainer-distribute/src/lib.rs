// Launcher for distributed data-parallel training runs
pub mod launcher;

pub use launcher::{
    CommandTemplate, DeviceSet, GroupResult, LaunchConfig, LaunchError, ProcessGroupSupervisor,
    RunId,
};
