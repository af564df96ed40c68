//! Process Group Supervisor Module
//!
//! Spawns one worker per device, then waits for the whole group. Spawning is
//! best effort per rank: a rank that fails to start is recorded and the
//! remaining ranks are still launched. The wait phase joins every started
//! worker, with no timeout and no early exit on failure.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::time::Instant;

use futures::future::join_all;

use super::command::CommandTemplate;
use super::device::DeviceSet;
use super::env::{BaseEnv, EnvMap, WorkerEnvBuilder};
use super::error::{LaunchError, Result};
use super::logger::AggregateLogger;
use super::process_manager::ProcessManager;

/// Everything needed to start one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub rank: usize,
    pub device_id: String,
    pub env: EnvMap,
    /// Full invocation, program first
    pub argv: Vec<String>,
}

impl WorkerSpec {
    /// Space-joined command line for logs
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// Final result for one rank
#[derive(Debug)]
pub enum WorkerOutcome {
    /// The worker ran and exited. `code` is `None` when it was killed by a signal.
    Exited { code: Option<i32> },
    /// The worker never started.
    SpawnFailed(LaunchError),
    /// The worker started but could not be waited on.
    WaitFailed(LaunchError),
}

impl WorkerOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0) })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code } => *code,
            _ => None,
        }
    }
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited { code: Some(code) } => write!(f, "exited with code {}", code),
            Self::Exited { code: None } => write!(f, "terminated by signal"),
            Self::SpawnFailed(e) => write!(f, "{}", e),
            Self::WaitFailed(e) => write!(f, "{}", e),
        }
    }
}

/// Per-rank outcomes of one launch
#[derive(Debug, Default)]
pub struct GroupResult {
    outcomes: BTreeMap<usize, WorkerOutcome>,
}

impl GroupResult {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, rank: usize) -> Option<&WorkerOutcome> {
        self.outcomes.get(&rank)
    }

    /// Outcomes in rank order
    pub fn iter(&self) -> impl Iterator<Item = (usize, &WorkerOutcome)> {
        self.outcomes.iter().map(|(rank, outcome)| (*rank, outcome))
    }

    pub fn ranks(&self) -> Vec<usize> {
        self.outcomes.keys().copied().collect()
    }

    /// Ranks that failed to spawn, exited non-zero, or died by signal
    pub fn failed_ranks(&self) -> Vec<usize> {
        self.iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(rank, _)| rank)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        !self.is_empty() && self.outcomes.values().all(WorkerOutcome::is_success)
    }

    /// Launcher exit code: 0 when every worker exited 0, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            0
        } else {
            1
        }
    }

    fn insert(&mut self, rank: usize, outcome: WorkerOutcome) {
        self.outcomes.insert(rank, outcome);
    }
}

/// A started worker, owned by the supervisor until it is collected
struct WorkerProcess {
    rank: usize,
    started_at: Instant,
    manager: ProcessManager,
}

impl WorkerProcess {
    /// Block until the worker exits.
    fn wait(self) -> WorkerOutcome {
        tracing::debug!("rank {}: waiting on PID {:?}", self.rank, self.manager.id());
        match self.manager.wait() {
            Ok(status) => WorkerOutcome::Exited {
                code: status.code(),
            },
            Err(e) => WorkerOutcome::WaitFailed(e),
        }
    }
}

/// Launches and waits on a group of workers.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroupSupervisor {
    env_builder: WorkerEnvBuilder,
    logs: Option<AggregateLogger>,
}

impl ProcessGroupSupervisor {
    pub fn new(env_builder: WorkerEnvBuilder) -> Self {
        Self {
            env_builder,
            logs: None,
        }
    }

    /// Pipe each worker's output into per-rank log files.
    pub fn with_output_capture(mut self, logs: AggregateLogger) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Build one spec per device, rank `i` bound to device `i`.
    pub fn plan(
        &self,
        devices: &DeviceSet,
        template: &CommandTemplate,
        base_env: &BaseEnv,
    ) -> Result<Vec<WorkerSpec>> {
        devices
            .iter()
            .enumerate()
            .map(|(rank, device_id)| {
                Ok(WorkerSpec {
                    rank,
                    device_id: device_id.to_string(),
                    env: self.env_builder.build(base_env, rank, devices)?,
                    argv: template.invocation(rank),
                })
            })
            .collect()
    }

    /// Start one worker per device and wait for all of them.
    ///
    /// Fails only when the group cannot be planned; nothing is spawned then.
    pub async fn launch(
        &self,
        devices: &DeviceSet,
        template: &CommandTemplate,
        base_env: &BaseEnv,
    ) -> Result<GroupResult> {
        let specs = self.plan(devices, template, base_env)?;
        Ok(self.launch_specs(specs).await)
    }

    /// Start every spec, then wait for every started worker.
    pub async fn launch_specs(&self, specs: Vec<WorkerSpec>) -> GroupResult {
        let total = specs.len();
        let mut result = GroupResult::default();
        let mut started = Vec::with_capacity(total);

        for spec in specs {
            match self.spawn_worker(&spec) {
                Ok(worker) => started.push(worker),
                Err(e) => {
                    tracing::error!("✗ rank {} failed to start: {}", spec.rank, e);
                    result.insert(spec.rank, WorkerOutcome::SpawnFailed(e));
                }
            }
        }

        tracing::info!(
            "{} of {} worker(s) started, waiting for the group to finish",
            started.len(),
            total
        );

        let waits = started.into_iter().map(|worker| {
            let rank = worker.rank;
            let started_at = worker.started_at;
            let handle = tokio::task::spawn_blocking(move || worker.wait());
            async move { (rank, started_at, handle.await) }
        });

        for (rank, started_at, joined) in join_all(waits).await {
            let outcome = joined.unwrap_or_else(|e| {
                WorkerOutcome::WaitFailed(LaunchError::Wait {
                    rank,
                    source: io::Error::new(io::ErrorKind::Other, e.to_string()),
                })
            });
            log_outcome(rank, started_at, &outcome);
            result.insert(rank, outcome);
        }

        result
    }

    fn spawn_worker(&self, spec: &WorkerSpec) -> Result<WorkerProcess> {
        let logger = match &self.logs {
            Some(logs) => Some(logs.register_worker(spec.rank, &spec.device_id)?),
            None => None,
        };

        let manager = ProcessManager::spawn(spec.rank, &spec.argv, &spec.env, logger)?;
        let pid = manager.id();
        tracing::info!(
            "✓ rank {} on device {} started (PID: {:?}): {}",
            spec.rank,
            spec.device_id,
            pid,
            spec.command_line()
        );

        Ok(WorkerProcess {
            rank: spec.rank,
            started_at: Instant::now(),
            manager,
        })
    }
}

fn log_outcome(rank: usize, started_at: Instant, outcome: &WorkerOutcome) {
    let elapsed = started_at.elapsed();
    match outcome {
        WorkerOutcome::Exited { code: Some(0) } => {
            tracing::info!("rank {} finished after {:.1?}", rank, elapsed)
        }
        WorkerOutcome::Exited { .. } => {
            tracing::warn!("⚠ rank {} {} after {:.1?}", rank, outcome, elapsed)
        }
        WorkerOutcome::SpawnFailed(_) | WorkerOutcome::WaitFailed(_) => {
            tracing::error!("✗ rank {}: {}", rank, outcome)
        }
    }
}
