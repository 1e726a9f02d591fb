//! Worker process spawning.
//!
//! The agent engine runs in a separate Python process. The supervisor only
//! needs a `Child` with piped stdio; everything else about the engine is
//! opaque. The spawn seam is a trait so tests can substitute a scripted
//! fake worker.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Default spawner: runs the agent engine script under a Python interpreter.
///
/// Output buffering and text encoding are forced in the child environment.
/// The line framing depends on it: a block-buffered child could emit
/// partial lines or multi-line batches at arbitrary flush points.
pub struct PythonSpawner {
    python: PathBuf,
    script: PathBuf,
}

impl PythonSpawner {
    pub fn new(python: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            script: script.into(),
        }
    }
}

impl WorkerSpawner for PythonSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.python)
            .arg(&self.script)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ShellSpawner;
    use super::*;

    #[tokio::test]
    async fn python_spawner_reports_missing_interpreter() {
        let spawner = PythonSpawner::new("/nonexistent/python3", "agent.py");
        assert!(matches!(spawner.spawn(), Err(SpawnError::Spawn(_))));
    }

    #[tokio::test]
    async fn shell_spawner_pipes_all_stdio() {
        let spawner = ShellSpawner::new("exit 0");
        let mut child = spawner.spawn().unwrap();
        assert!(child.stdin.is_some());
        assert!(child.stdout.is_some());
        assert!(child.stderr.is_some());
        let status = child.wait().await.unwrap();
        assert!(status.success());
    }
}
