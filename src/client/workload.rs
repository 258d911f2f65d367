//! The load run on the system under test while a phase is sampled.

use crate::error::{AppResult, DirectorError};
use crate::session::Phase;
use async_trait::async_trait;
use std::path::Path;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::info;

/// Something the client runs between `start` and `stop` of a phase.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Run to completion for `phase`, writing logs into `loadgen_dir`.
    async fn run(&self, phase: Phase, loadgen_dir: &Path) -> AppResult<ExitStatus>;
}

/// A shell command, run with `out=<loadgen dir>` and `PHASE=<phase>` set.
#[derive(Debug, Clone)]
pub struct ShellWorkload {
    command: String,
}

impl ShellWorkload {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn shell(&self) -> Command {
        #[cfg(unix)]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        }
        #[cfg(not(unix))]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        }
    }
}

#[async_trait]
impl Workload for ShellWorkload {
    async fn run(&self, phase: Phase, loadgen_dir: &Path) -> AppResult<ExitStatus> {
        info!(%phase, command = %self.command, "Running workload");
        let status = self
            .shell()
            .env("out", loadgen_dir)
            .env("PHASE", phase.as_str())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| DirectorError::Workload(format!("'{}': {}", self.command, e)))?;
        info!(%phase, %status, "Workload finished");
        Ok(status)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_environment_is_passed() {
        let dir = TempDir::new().unwrap();
        let workload = ShellWorkload::new("echo \"$PHASE\" > \"$out/phase.txt\"");

        let status = workload.run(Phase::Testing, dir.path()).await.unwrap();
        assert!(status.success());
        let written = std::fs::read_to_string(dir.path().join("phase.txt")).unwrap();
        assert_eq!(written.trim(), "testing");
    }

    #[tokio::test]
    async fn test_exit_status_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let status = ShellWorkload::new("exit 3")
            .run(Phase::Ranging, dir.path())
            .await
            .unwrap();
        assert_eq!(status.code(), Some(3));
    }
}
