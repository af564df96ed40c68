//! Command Builder Module
//!
//! Builds the argument vector shared by all workers once, then specializes its
//! trailing rank flag per worker.

use std::path::{Path, PathBuf};

use super::run_id::RunId;

/// Argument vector shared by every worker of a run.
///
/// `args[0]` is the target script; the last element is a placeholder that
/// [`CommandTemplate::specialize`] overwrites with `--rank=<r>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    interpreter: Option<String>,
    args: Vec<String>,
}

impl CommandTemplate {
    /// Build the template.
    ///
    /// `passthrough` is forwarded verbatim and never inspected.
    pub fn build(
        script: &str,
        known_script_dir: &Path,
        continue_path: &str,
        restore_path: &str,
        run_id: &RunId,
        passthrough: &[String],
        interpreter: Option<String>,
    ) -> Self {
        let executable = resolve_executable(script, known_script_dir);

        let mut args = Vec::with_capacity(passthrough.len() + 6);
        args.push(executable);
        args.push(format!("--continue_path={}", continue_path));
        args.push(format!("--restore_path={}", restore_path));
        args.push(format!("--group_id={}", run_id.group_tag()));
        args.push("--use_ddp=true".to_string());
        args.extend(passthrough.iter().cloned());
        // rank placeholder
        args.push(String::new());

        Self {
            interpreter: interpreter.filter(|i| !i.is_empty()),
            args,
        }
    }

    pub fn executable(&self) -> &str {
        &self.args[0]
    }

    pub fn interpreter(&self) -> Option<&str> {
        self.interpreter.as_deref()
    }

    /// Script argument vector for `rank`.
    pub fn specialize(&self, rank: usize) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(last) = args.last_mut() {
            *last = format!("--rank={}", rank);
        }
        args
    }

    /// Full process invocation for `rank`, interpreter first when configured.
    pub fn invocation(&self, rank: usize) -> Vec<String> {
        let args = self.specialize(rank);
        match &self.interpreter {
            Some(interpreter) => std::iter::once(interpreter.clone()).chain(args).collect(),
            None => args,
        }
    }
}

/// Use `<dir>/<script>` when it exists, otherwise `script` as given so the
/// search path can resolve it.
pub fn resolve_executable(script: &str, known_script_dir: &Path) -> String {
    let candidate = known_script_dir.join(script);
    if candidate.exists() {
        absolute(&candidate).to_string_lossy().into_owned()
    } else {
        script.to_string()
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
