//! Worker Environment Module
//!
//! Builds the environment each worker is started with. Every worker gets its
//! own copy of a base snapshot; the snapshot and the launcher's own process
//! environment are never modified.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use super::device::{DeviceSet, VISIBLE_DEVICES_VAR};
use super::error::{LaunchError, Result};

/// Environment handed to one worker process.
pub type EnvMap = BTreeMap<OsString, OsString>;

/// Immutable snapshot of the launcher's environment.
///
/// Names and values are kept as OS strings so entries that are not valid
/// UTF-8 still reach the workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseEnv {
    vars: EnvMap,
}

impl BaseEnv {
    /// Snapshot the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars_os().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            vars: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&OsStr> {
        self.vars.get(OsStr::new(key)).map(OsString::as_os_str)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Names of the variables set per worker, plus the scratch cache root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvKeys {
    pub rank: String,
    pub visible_devices: String,
    pub scratch_cache: String,
    pub scratch_root: PathBuf,
}

impl Default for EnvKeys {
    fn default() -> Self {
        Self {
            rank: "RANK".to_string(),
            visible_devices: VISIBLE_DEVICES_VAR.to_string(),
            scratch_cache: "PYTHON_EGG_CACHE".to_string(),
            scratch_root: PathBuf::from("/tmp"),
        }
    }
}

/// Builds per-worker environments.
#[derive(Debug, Clone, Default)]
pub struct WorkerEnvBuilder {
    keys: EnvKeys,
}

impl WorkerEnvBuilder {
    pub fn new(keys: EnvKeys) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &EnvKeys {
        &self.keys
    }

    /// Environment for the worker at `rank`.
    ///
    /// The visibility variable lists the whole device set; the rank tells the
    /// worker which of those devices to bind.
    pub fn build(&self, base: &BaseEnv, rank: usize, devices: &DeviceSet) -> Result<EnvMap> {
        let device_id = devices.device_for_rank(rank).ok_or_else(|| {
            LaunchError::config(format!(
                "rank {} is out of range for {} device(s)",
                rank,
                devices.len()
            ))
        })?;
        let mut env = base.vars.clone();

        env.insert(
            self.keys.scratch_cache.clone().into(),
            self.scratch_path(device_id).into_os_string(),
        );
        env.insert(self.keys.rank.clone().into(), rank.to_string().into());
        env.insert(self.keys.visible_devices.clone().into(), devices.joined().into());

        Ok(env)
    }

    /// Scratch cache directory for one device, e.g. `/tmp/tmp1`.
    pub fn scratch_path(&self, device_id: &str) -> PathBuf {
        self.keys.scratch_root.join(format!("tmp{}", device_id))
    }
}
