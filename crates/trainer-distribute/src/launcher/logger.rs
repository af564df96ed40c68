//! Worker output capture.
//!
//! When a log directory is configured each worker's stdout/stderr is piped,
//! echoed with a rank prefix, and appended to `rank<r>-device<d>.log`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::error::Result;

/// Which pipe a captured line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn tag(self) -> &'static str {
        match self {
            Self::Stdout => "OUT",
            Self::Stderr => "ERR",
        }
    }
}

/// Log sink for a single worker, shared by its stdout and stderr readers.
#[derive(Clone)]
pub struct WorkerLogger {
    rank: usize,
    device_id: String,
    path: PathBuf,
    file: Arc<Mutex<File>>,
}

impl WorkerLogger {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Echo one line and append it to the worker's log file.
    pub fn write(&self, stream: Stream, line: &str) {
        match stream {
            Stream::Stdout => println!("[rank{}] {}", self.rank, line),
            Stream::Stderr => eprintln!("[rank{}] {}", self.rank, line),
        }

        let formatted = format!(
            "[{}] [{}] [device:{}] {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            stream.tag(),
            self.device_id,
            line
        );

        // a poisoned lock only means another reader panicked mid-write
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", formatted) {
            tracing::warn!("Failed to write log for rank {}: {}", self.rank, e);
        }
    }
}

/// Creates per-worker log files under one directory.
#[derive(Debug, Clone)]
pub struct AggregateLogger {
    log_dir: PathBuf,
}

impl AggregateLogger {
    /// Create the log directory if needed.
    pub fn new(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Open (append) the log file for one worker.
    pub fn register_worker(&self, rank: usize, device_id: &str) -> Result<WorkerLogger> {
        let path = self.log_path(rank, device_id);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(WorkerLogger {
            rank,
            device_id: device_id.to_string(),
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn log_path(&self, rank: usize, device_id: &str) -> PathBuf {
        self.log_dir.join(format!("rank{}-device{}.log", rank, device_id))
    }
}
