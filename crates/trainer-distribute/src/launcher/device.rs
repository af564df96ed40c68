//! Device Set Module
//!
//! Resolves the ordered list of device identifiers a run will use, either from
//! an externally preset visibility mask or from an explicit `--gpus` list.

use std::fmt;
use std::ops::Index;

use super::error::{LaunchError, Result};

/// Default environment variable that limits which accelerators a process sees.
pub const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Ordered, non-empty set of device identifiers.
///
/// Rank `i` is bound to the device at index `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSet {
    ids: Vec<String>,
}

impl DeviceSet {
    /// Build a device set, rejecting an empty list.
    pub fn new(ids: Vec<String>) -> Result<Self> {
        if ids.is_empty() {
            return Err(LaunchError::config("device set must not be empty"));
        }
        Ok(Self { ids })
    }

    /// Enumerate `"0".."count-1"`.
    pub fn enumerate(count: usize) -> Result<Self> {
        Self::new((0..count).map(|i| i.to_string()).collect())
    }

    /// Parse a comma-separated list such as `"0,1,3"`.
    ///
    /// Whitespace around entries is trimmed and empty entries are dropped.
    pub fn parse(list: &str) -> Result<Self> {
        let ids: Vec<String> = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        Self::new(ids).map_err(|_| {
            LaunchError::config(format!("device list {:?} contains no device ids", list))
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Device bound to `rank`, if the rank is in range.
    pub fn device_for_rank(&self, rank: usize) -> Option<&str> {
        self.ids.get(rank).map(String::as_str)
    }

    /// Comma-joined form used for the visibility variable.
    pub fn joined(&self) -> String {
        self.ids.join(",")
    }
}

impl Index<usize> for DeviceSet {
    type Output = str;

    fn index(&self, rank: usize) -> &str {
        &self.ids[rank]
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.joined())
    }
}

/// Platform query for how many devices the current process can use.
pub trait DeviceCountQuery {
    /// `visible` is the value of the visibility variable that triggered the query.
    fn device_count(&self, visible: &str) -> Result<usize>;
}

/// Number of devices the CUDA runtime exposes under `mask`.
///
/// Entries are read left to right and counting stops at the first entry that
/// is not a device index or a `GPU-`/`MIG-` UUID. A negative index, a repeated
/// entry, or an index at or above `installed` (when known) also ends the list.
pub fn count_masked_devices(mask: &str, installed: Option<usize>) -> usize {
    let mut seen: Vec<&str> = Vec::new();

    for entry in mask.split(',').map(str::trim) {
        let valid = if entry.starts_with("GPU-") || entry.starts_with("MIG-") {
            true
        } else if !entry.is_empty() && entry.bytes().all(|b| b.is_ascii_digit()) {
            match entry.parse::<usize>() {
                Ok(index) => installed.map_or(true, |n| index < n),
                Err(_) => false,
            }
        } else {
            false
        };

        if !valid || seen.contains(&entry) {
            break;
        }
        seen.push(entry);
    }

    seen.len()
}

/// Applies the runtime's masking rules to the visibility variable.
///
/// This is the number of devices the accelerator runtime exposes to a process
/// started with that mask, so no driver call is needed.
#[derive(Debug, Clone, Copy, Default)]
pub struct VisibleDeviceCount;

impl DeviceCountQuery for VisibleDeviceCount {
    fn device_count(&self, visible: &str) -> Result<usize> {
        Ok(count_masked_devices(visible, None))
    }
}

/// Asks the NVIDIA driver through NVML.
///
/// NVML ignores the visibility mask, so the driver count only bounds which
/// mask indices are valid.
#[cfg(feature = "nvml")]
#[derive(Debug, Clone, Copy, Default)]
pub struct NvmlDeviceCount;

#[cfg(feature = "nvml")]
impl DeviceCountQuery for NvmlDeviceCount {
    fn device_count(&self, visible: &str) -> Result<usize> {
        let nvml = nvml_wrapper::Nvml::init()
            .map_err(|e| LaunchError::config(format!("NVML init failed: {}", e)))?;
        let driver_count = nvml
            .device_count()
            .map_err(|e| LaunchError::config(format!("NVML device count failed: {}", e)))?
            as usize;
        Ok(count_masked_devices(visible, Some(driver_count)))
    }
}

/// Resolve the device set for a run.
///
/// A present visibility mask wins over the explicit list and is enumerated as
/// `"0".."K-1"` (the ids the worker will see after masking). When the mask
/// yields no devices the explicit list is used instead.
pub fn resolve(
    visible: Option<&str>,
    explicit: Option<&str>,
    query: &dyn DeviceCountQuery,
) -> Result<DeviceSet> {
    if let Some(visible) = visible {
        let count = query.device_count(visible)?;
        if count > 0 {
            tracing::debug!(
                "{}={:?} is set, enumerating {} visible device(s)",
                VISIBLE_DEVICES_VAR,
                visible,
                count
            );
            return DeviceSet::enumerate(count);
        }
        tracing::warn!(
            "{}={:?} exposes no devices, falling back to the explicit list",
            VISIBLE_DEVICES_VAR,
            visible
        );
    }

    match explicit {
        Some(list) => DeviceSet::parse(list),
        None => Err(LaunchError::config(format!(
            "no devices to launch on: {} is not set and no --gpus list was given",
            VISIBLE_DEVICES_VAR
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCount(usize);

    impl DeviceCountQuery for FixedCount {
        fn device_count(&self, _visible: &str) -> Result<usize> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_explicit_list_keeps_order() {
        let set = resolve(None, Some("3,1,2"), &VisibleDeviceCount).unwrap();
        assert_eq!(set.len(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["3", "1", "2"]);
        assert_eq!(set.device_for_rank(0), Some("3"));
        assert_eq!(set.device_for_rank(3), None);
    }

    #[test]
    fn test_visible_devices_override_explicit_list() {
        let set = resolve(Some("4,5"), Some("7,8,9"), &FixedCount(4)).unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["0", "1", "2", "3"]);
    }

    #[test]
    fn test_visible_device_count_counts_mask_entries() {
        assert_eq!(VisibleDeviceCount.device_count("2,3").unwrap(), 2);
        assert_eq!(VisibleDeviceCount.device_count(" 2 , 3 ").unwrap(), 2);
        assert_eq!(VisibleDeviceCount.device_count("").unwrap(), 0);

        let set = resolve(Some("6"), None, &VisibleDeviceCount).unwrap();
        assert_eq!(set.joined(), "0");
    }

    #[test]
    fn test_negative_entry_hides_everything_after_it() {
        assert_eq!(VisibleDeviceCount.device_count("-1").unwrap(), 0);
        assert_eq!(VisibleDeviceCount.device_count("0,-1,2").unwrap(), 1);

        let err = resolve(Some("-1"), None, &VisibleDeviceCount).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));

        let set = resolve(Some("-1"), Some("4,5"), &VisibleDeviceCount).unwrap();
        assert_eq!(set.joined(), "4,5");

        let set = resolve(Some("0,-1,2"), None, &VisibleDeviceCount).unwrap();
        assert_eq!(set.joined(), "0");
    }

    #[test]
    fn test_invalid_or_repeated_entries_end_the_mask() {
        assert_eq!(count_masked_devices("1,foo,2", None), 1);
        assert_eq!(count_masked_devices("1,,2", None), 1);
        assert_eq!(count_masked_devices("0,1,0,2", None), 2);
        assert_eq!(count_masked_devices("GPU-8f3a,MIG-11aa,3", None), 3);
    }

    #[test]
    fn test_indices_past_installed_devices_end_the_mask() {
        assert_eq!(count_masked_devices("0,1,7,2", Some(4)), 2);
        assert_eq!(count_masked_devices("5", Some(4)), 0);
        assert_eq!(count_masked_devices("3,2,1,0", Some(4)), 4);
    }

    #[test]
    fn test_empty_mask_falls_back_to_explicit_list() {
        let set = resolve(Some(""), Some("1,2"), &VisibleDeviceCount).unwrap();
        assert_eq!(set.joined(), "1,2");
    }

    #[test]
    fn test_missing_sources_is_configuration_error() {
        let err = resolve(None, None, &VisibleDeviceCount).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));

        let err = resolve(None, Some(""), &VisibleDeviceCount).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));

        let err = resolve(Some(""), Some(" , "), &FixedCount(0)).unwrap_err();
        assert!(matches!(err, LaunchError::Configuration(_)));
    }

    #[test]
    fn test_parse_trims_entries() {
        let set = DeviceSet::parse(" 0, 1 ,2,").unwrap();
        assert_eq!(set.joined(), "0,1,2");
        assert_eq!(&set[1], "1");
        assert_eq!(format!("{}", set), "[0,1,2]");
    }
}
