//! trainer-distribute - Main Entry Point
//!
//! Runs a training script once per device in distributed data-parallel mode
//! and waits for every worker to exit.
//!
//! # Usage
//!
//! ```bash
//! # Use GPUs 0 and 1
//! trainer-distribute --script train.py --gpus 0,1 --coqpit.batch_size=32
//!
//! # Use every GPU exposed by the preset mask
//! CUDA_VISIBLE_DEVICES=2,3 trainer-distribute --script train.py
//!
//! # Continue a previous run, capturing worker output per rank
//! trainer-distribute --script train.py --gpus 0,1 \
//!     --continue_path runs/vits-2024_05_06-070809 \
//!     --log-dir logs/
//! ```
//!
//! Exit code is 0 when every worker exits 0, 1 when any worker fails to start
//! or exits non-zero, 2 when the launch configuration is invalid.

use std::process;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trainer_distribute::launcher::{
    self, AggregateLogger, BaseEnv, CommandTemplate, DistributeArgs, GroupResult, LaunchConfig,
    LaunchError, ProcessGroupSupervisor, RunId, WorkerEnvBuilder,
};

#[tokio::main]
async fn main() {
    let args = DistributeArgs::parse_known();
    init_logging(&args.log_level);

    match run(args).await {
        Ok(result) => {
            report(&result);
            process::exit(result.exit_code());
        }
        Err(e) => {
            tracing::error!("✗ Launch aborted: {:#}", e);
            let code = e.downcast_ref::<LaunchError>().map_or(1, LaunchError::exit_code);
            process::exit(code);
        }
    }
}

async fn run(args: DistributeArgs) -> Result<GroupResult> {
    let config = LaunchConfig::try_from(args)?;

    let base_env = BaseEnv::capture();
    let visible = base_env
        .get(&config.env_keys.visible_devices)
        .map(|mask| mask.to_string_lossy());

    #[cfg(feature = "nvml")]
    let query = launcher::NvmlDeviceCount;
    #[cfg(not(feature = "nvml"))]
    let query = launcher::VisibleDeviceCount;

    let devices = launcher::resolve(visible.as_deref(), config.gpus.as_deref(), &query)?;
    let run_id = RunId::generate();

    tracing::info!("🚀 trainer-distribute starting...");
    tracing::info!("  Script:  {}", config.script);
    tracing::info!("  Devices: {} ({} worker(s))", devices, devices.len());
    tracing::info!("  Group:   {}", run_id.group_tag());

    let template = CommandTemplate::build(
        &config.script,
        &config.script_dir,
        &config.continue_path,
        &config.restore_path,
        &run_id,
        &config.passthrough,
        config.interpreter.clone(),
    );

    let mut supervisor = ProcessGroupSupervisor::new(WorkerEnvBuilder::new(config.env_keys.clone()));
    if let Some(ref log_dir) = config.log_dir {
        let logs = AggregateLogger::new(log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        tracing::info!("  Logs:    {}", logs.log_dir().display());
        supervisor = supervisor.with_output_capture(logs);
    }

    Ok(supervisor.launch(&devices, &template, &base_env).await?)
}

fn report(result: &GroupResult) {
    for (rank, outcome) in result.iter() {
        tracing::info!("  rank {}: {}", rank, outcome);
    }

    if result.is_success() {
        tracing::info!("All {} worker(s) finished successfully", result.len());
    } else {
        tracing::error!(
            "{} of {} worker(s) failed: ranks {:?}",
            result.failed_ranks().len(),
            result.len(),
            result.failed_ranks()
        );
    }
}

/// `RUST_LOG` takes precedence over `--log-level`.
fn init_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
