//! Process Manager Module
//!
//! Owns one spawned worker process and, when output is captured, the threads
//! draining its pipes.

use std::io::{self, BufRead, BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use super::env::EnvMap;
use super::error::{LaunchError, Result};
use super::logger::{Stream, WorkerLogger};

/// Manages a single worker process
pub struct ProcessManager {
    rank: usize,
    process: Option<Child>,
    readers: Vec<JoinHandle<()>>,
}

impl ProcessManager {
    /// Spawn `argv[0]` with `argv[1..]` and exactly `env` as its environment.
    ///
    /// With `logger` set, stdout and stderr are piped into it; otherwise the
    /// child inherits the launcher's stdio.
    pub fn spawn(
        rank: usize,
        argv: &[String],
        env: &EnvMap,
        logger: Option<WorkerLogger>,
    ) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LaunchError::config(format!("empty command for rank {}", rank)))?;

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear().envs(env);

        if logger.is_some() {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            rank,
            program: program.clone(),
            source,
        })?;

        let mut readers = Vec::new();
        if let Some(logger) = logger {
            if let Some(stdout) = child.stdout.take() {
                readers.push(forward_lines(stdout, Stream::Stdout, logger.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(forward_lines(stderr, Stream::Stderr, logger));
            }
        }

        Ok(Self {
            rank,
            process: Some(child),
            readers,
        })
    }

    /// Get the process ID
    pub fn id(&self) -> Option<u32> {
        self.process.as_ref().map(|p| p.id())
    }

    /// Block until the process exits and its output has been drained.
    pub fn wait(mut self) -> Result<ExitStatus> {
        let mut process = self.process.take().ok_or_else(|| LaunchError::Wait {
            rank: self.rank,
            source: io::Error::new(io::ErrorKind::Other, "process already collected"),
        })?;

        let status = process.wait().map_err(|source| LaunchError::Wait {
            rank: self.rank,
            source,
        })?;

        for reader in self.readers.drain(..) {
            if reader.join().is_err() {
                tracing::warn!("Output reader for rank {} panicked", self.rank);
            }
        }

        Ok(status)
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        // Dropped without being waited on: don't leave an orphan behind.
        if let Some(ref mut process) = self.process {
            let _ = process.kill();
            let _ = process.wait();
        }
    }
}

/// Drain `pipe` until EOF, one line at a time.
///
/// The pipe must stay open for the child's whole life, otherwise its next
/// write fails with SIGPIPE. Lines that are not UTF-8 are logged lossily.
fn forward_lines<R>(pipe: R, stream: Stream, logger: WorkerLogger) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    logger.write(stream, line.trim_end_matches(['\n', '\r']));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("Stopped reading {:?} of rank {}: {}", stream, logger.rank(), e);
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    fn path_env() -> EnvMap {
        std::env::var_os("PATH")
            .map(|p| EnvMap::from([("PATH".into(), p)]))
            .unwrap_or_default()
    }

    #[test]
    fn test_spawn_and_wait_reports_exit_code() {
        let pm = ProcessManager::spawn(0, &sh("exit 3"), &path_env(), None).unwrap();
        assert!(pm.id().is_some());
        let status = pm.wait().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn test_child_sees_only_given_env() {
        let mut env = path_env();
        env.insert("RANK".into(), "5".into());

        let pm = ProcessManager::spawn(
            0,
            &sh(r#"[ "$RANK" = 5 ] && [ -z "$HOME" ]"#),
            &env,
            None,
        )
        .unwrap();
        assert!(pm.wait().unwrap().success());
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let argv = vec!["/definitely/not/a/real/program".to_string()];
        let err = ProcessManager::spawn(2, &argv, &EnvMap::new(), None).err().unwrap();
        match err {
            LaunchError::Spawn { rank, program, .. } => {
                assert_eq!(rank, 2);
                assert_eq!(program, "/definitely/not/a/real/program");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_empty_command_rejected() {
        let err = ProcessManager::spawn(0, &[], &EnvMap::new(), None).err().unwrap();
        assert!(matches!(err, LaunchError::Configuration(_)));
    }

    #[test]
    fn test_captured_output_reaches_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let logs = super::super::logger::AggregateLogger::new(dir.path()).unwrap();
        let logger = logs.register_worker(0, "1").unwrap();
        let log_path = logger.path().to_path_buf();

        let pm = ProcessManager::spawn(
            0,
            &sh("echo hello; echo oops >&2"),
            &path_env(),
            Some(logger),
        )
        .unwrap();
        assert!(pm.wait().unwrap().success());

        let content = std::fs::read_to_string(log_path).unwrap();
        assert!(content.contains("[OUT] [device:1] hello"));
        assert!(content.contains("[ERR] [device:1] oops"));
    }

    #[test]
    fn test_capture_keeps_draining_after_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let logs = super::super::logger::AggregateLogger::new(dir.path()).unwrap();
        let logger = logs.register_worker(0, "0").unwrap();
        let log_path = logger.path().to_path_buf();

        // well past the 64 KiB pipe buffer
        let script = r#"printf 'bad \377 byte\n'
i=0
while [ $i -lt 5000 ]; do
  echo "step $i of a fairly long progress line to fill the pipe"
  i=$((i + 1))
done
exit 0"#;
        let pm = ProcessManager::spawn(0, &sh(script), &path_env(), Some(logger)).unwrap();
        let status = pm.wait().unwrap();
        assert_eq!(status.code(), Some(0));

        let content = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(content.lines().count(), 5001);
        assert!(content.contains("bad \u{FFFD} byte"));
        assert!(content.contains("step 4999 of a fairly long progress line"));
    }

    #[cfg(unix)]
    #[test]
    fn test_child_inherits_non_utf8_values() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let mut env = path_env();
        env.insert("RAW".into(), OsStr::from_bytes(b"\xff").to_os_string());

        let pm = ProcessManager::spawn(
            0,
            &sh(r#"[ "$RAW" = "$(printf '\377')" ]"#),
            &env,
            None,
        )
        .unwrap();
        assert!(pm.wait().unwrap().success());
    }
}
