//! Launcher Configuration Module
//!
//! Command-line arguments and the validated configuration built from them.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Command, CommandFactory, Parser};

use super::env::EnvKeys;
use super::error::{LaunchError, Result};

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Launcher configuration
///
/// Everything needed to start one worker group.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Target training script, relative to `script_dir` or resolvable on PATH
    pub script: String,

    /// Explicit device list, used when no visibility mask is preset
    pub gpus: Option<String>,

    /// Forwarded as `--continue_path=`
    pub continue_path: String,

    /// Forwarded as `--restore_path=`
    pub restore_path: String,

    /// Runtime prefixed to each worker command (`None` runs the script directly)
    pub interpreter: Option<String>,

    /// Directory searched first for `script`
    pub script_dir: PathBuf,

    /// Capture worker output into this directory
    pub log_dir: Option<PathBuf>,

    /// Launcher log level
    pub log_level: String,

    /// Per-worker environment variable names
    pub env_keys: EnvKeys,

    /// Arguments forwarded verbatim to every worker
    pub passthrough: Vec<String>,
}

impl LaunchConfig {
    /// Create a config for `script` with default values
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            gpus: None,
            continue_path: String::new(),
            restore_path: String::new(),
            interpreter: Some("python3".to_string()),
            script_dir: PathBuf::from("."),
            log_dir: None,
            log_level: "info".to_string(),
            env_keys: EnvKeys::default(),
            passthrough: Vec::new(),
        }
    }

    /// Set the explicit device list
    pub fn with_gpus(mut self, gpus: impl Into<String>) -> Self {
        self.gpus = Some(gpus.into());
        self
    }

    /// Set continue and restore paths
    pub fn with_checkpoint_paths(
        mut self,
        continue_path: impl Into<String>,
        restore_path: impl Into<String>,
    ) -> Self {
        self.continue_path = continue_path.into();
        self.restore_path = restore_path.into();
        self
    }

    /// Set interpreter; an empty string runs the script directly
    pub fn with_interpreter(mut self, interpreter: impl Into<String>) -> Self {
        let interpreter = interpreter.into();
        self.interpreter = (!interpreter.is_empty()).then_some(interpreter);
        self
    }

    /// Set the known script directory
    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = dir.into();
        self
    }

    /// Set log directory
    pub fn with_log_dir(mut self, log_dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(log_dir.into());
        self
    }

    /// Set env variable names
    pub fn with_env_keys(mut self, keys: EnvKeys) -> Self {
        self.env_keys = keys;
        self
    }

    /// Set forwarded arguments
    pub fn with_passthrough(mut self, args: Vec<String>) -> Self {
        self.passthrough = args;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.script.trim().is_empty() {
            return Err(LaunchError::config("--script must not be empty"));
        }
        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(LaunchError::config(format!(
                "invalid log level {:?}, expected one of {:?}",
                self.log_level, LOG_LEVELS
            )));
        }
        Ok(())
    }
}

/// Command-line arguments for trainer-distribute
///
/// Launcher flags may appear anywhere on the command line; every other
/// argument is forwarded to the workers in its original order. Everything
/// after `--` is forwarded, even if it looks like a launcher flag.
#[derive(Parser, Debug)]
#[command(name = "trainer-distribute")]
#[command(version)]
#[command(about = "Launch a training script once per device in distributed data-parallel mode")]
pub struct DistributeArgs {
    /// Target training script to distribute
    #[arg(long)]
    pub script: String,

    /// Device ids to use, e.g. "0,1". Ignored when CUDA_VISIBLE_DEVICES is set.
    #[arg(long)]
    pub gpus: Option<String>,

    /// Run folder to continue training from
    #[arg(long = "continue_path", default_value = "")]
    pub continue_path: String,

    /// Checkpoint to restore from
    #[arg(long = "restore_path", default_value = "")]
    pub restore_path: String,

    /// Program used to run the script; pass "" for executables
    #[arg(long, default_value = "python3")]
    pub interpreter: String,

    /// Directory searched for the script before PATH (defaults to the launcher's directory)
    #[arg(long)]
    pub script_dir: Option<PathBuf>,

    /// Root for per-device scratch caches
    #[arg(long, default_value = "/tmp")]
    pub scratch_root: PathBuf,

    /// Capture each worker's output into <DIR>/rank<r>-device<d>.log
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Arguments forwarded verbatim to every worker
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "ARGS")]
    pub passthrough: Vec<String>,
}

impl DistributeArgs {
    /// Parse the process arguments, exiting with a usage error on failure.
    pub fn parse_known() -> Self {
        Self::try_parse_known_from(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    /// Parse `argv` (program name first), pulling launcher flags out from
    /// between the forwarded ones.
    pub fn try_parse_known_from<I, T>(argv: I) -> std::result::Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let mut cmd = Self::command();
        cmd.build();

        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .unwrap_or_else(|| OsString::from("trainer-distribute"));

        let mut launcher = Vec::new();
        let mut forwarded = Vec::new();
        while let Some(arg) = argv.next() {
            let Some(text) = arg.to_str() else {
                forwarded.push(arg);
                continue;
            };
            if text == "--" {
                forwarded.extend(argv.by_ref());
                break;
            }
            match launcher_flag(&cmd, text) {
                Some(needs_value) => {
                    launcher.push(arg);
                    if needs_value {
                        launcher.extend(argv.next());
                    }
                }
                None => forwarded.push(arg),
            }
        }

        let rebuilt = std::iter::once(program)
            .chain(launcher)
            .chain(std::iter::once(OsString::from("--")))
            .chain(forwarded);
        Self::try_parse_from(rebuilt)
    }
}

/// Whether `arg` names one of the launcher's own options.
///
/// Returns `Some(true)` when the option's value is the next argument.
fn launcher_flag(cmd: &Command, arg: &str) -> Option<bool> {
    if let Some(long) = arg.strip_prefix("--") {
        let (name, inline_value) = match long.split_once('=') {
            Some((name, _)) => (name, true),
            None => (long, false),
        };
        return cmd
            .get_arguments()
            .find(|a| !a.is_positional() && a.get_long() == Some(name))
            .map(|a| a.get_action().takes_values() && !inline_value);
    }

    let mut chars = arg.strip_prefix('-')?.chars();
    let short = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    cmd.get_arguments()
        .find(|a| a.get_short() == Some(short))
        .map(|a| a.get_action().takes_values())
}

impl TryFrom<DistributeArgs> for LaunchConfig {
    type Error = LaunchError;

    fn try_from(args: DistributeArgs) -> Result<Self> {
        let script_dir = match args.script_dir {
            Some(dir) => dir,
            None => launcher_dir()?,
        };

        let env_keys = EnvKeys {
            scratch_root: args.scratch_root,
            ..EnvKeys::default()
        };

        let mut config = LaunchConfig::new(args.script)
            .with_checkpoint_paths(args.continue_path, args.restore_path)
            .with_interpreter(args.interpreter)
            .with_script_dir(script_dir)
            .with_env_keys(env_keys)
            .with_passthrough(args.passthrough);
        config.gpus = args.gpus;
        config.log_dir = args.log_dir;
        config.log_level = args.log_level;

        config.validate()?;
        Ok(config)
    }
}

/// Directory holding the running launcher binary
fn launcher_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    exe.parent()
        .map(|dir| dir.to_path_buf())
        .ok_or_else(|| LaunchError::config("failed to get launcher directory"))
}
