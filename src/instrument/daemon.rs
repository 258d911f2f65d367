//! PTDaemon process management

use super::{Analyzer, AnalyzerLauncher, AnalyzerSettings, InstrumentError};
use crate::adapters::TcpLineAdapter;
use crate::config::PtdConfig;
use crate::error_recovery::RetryPolicy;
use async_trait::async_trait;
use std::fs::{self, OpenOptions};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Time the daemon gets to exit after SIGTERM before it is killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// A spawned PTDaemon process
///
/// The child is killed if this handle is dropped without
/// [`DaemonProcess::terminate`].
pub struct DaemonProcess {
    child: Child,
    port: u16,
}

impl DaemonProcess {
    /// Spawn the daemon with its configured flags.
    ///
    /// Fails early if something already listens on the control port. The
    /// daemon's stdout and stderr are appended to `stdout_log`.
    pub async fn spawn(config: &PtdConfig, stdout_log: &Path) -> Result<Self, InstrumentError> {
        let port = config.network_port;
        if port_is_open(port).await {
            return Err(InstrumentError::PortInUse(port));
        }

        if let Some(parent) = stdout_log.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| InstrumentError::Spawn(format!("{}: {}", parent.display(), e)))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(stdout_log)
            .map_err(|e| InstrumentError::Spawn(format!("{}: {}", stdout_log.display(), e)))?;
        let log_err = log
            .try_clone()
            .map_err(|e| InstrumentError::Spawn(e.to_string()))?;

        let args = config.daemon_args();
        info!(executable = %config.executable.display(), args = ?args, "Starting PTDaemon");
        let child = Command::new(&config.executable)
            .args(&args)
            .env("TZ", "UTC")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InstrumentError::Spawn(format!("{}: {}", config.executable.display(), e))
            })?;

        Ok(Self { child, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process has already exited.
    pub fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }

    /// Ask the daemon to exit, killing it after [`TERMINATE_GRACE`].
    pub async fn terminate(&mut self) {
        self.terminate_within(TERMINATE_GRACE).await
    }

    pub async fn terminate_within(&mut self, grace: Duration) {
        if self.exit_status().is_some() {
            return;
        }
        info!(pid = ?self.pid(), "Stopping PTDaemon");
        self.request_exit();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => info!(%status, "PTDaemon exited"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for PTDaemon"),
            Err(_) => {
                warn!(grace = ?grace, "PTDaemon ignored the stop request, killing it");
                if let Err(e) = self.child.kill().await {
                    warn!(error = %e, "Failed to kill PTDaemon");
                }
            }
        }
    }

    #[cfg(unix)]
    fn request_exit(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            #[allow(clippy::cast_possible_wrap)]
            let target = Pid::from_raw(pid as i32);
            if let Err(e) = kill(target, Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to signal PTDaemon");
            }
        }
    }

    #[cfg(not(unix))]
    fn request_exit(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!(error = %e, "Failed to stop PTDaemon");
        }
    }
}

async fn port_is_open(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    matches!(
        tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Launches a real PTDaemon and connects an [`Analyzer`] to it
pub struct DaemonLauncher {
    config: PtdConfig,
    stdout_log: PathBuf,
}

impl DaemonLauncher {
    /// # Arguments
    /// * `config` - Daemon flags and timing
    /// * `out_dir` - Directory receiving `ptd_stdout.log`
    pub fn new(config: PtdConfig, out_dir: &Path) -> Self {
        Self {
            config,
            stdout_log: out_dir.join("ptd_stdout.log"),
        }
    }
}

#[async_trait]
impl AnalyzerLauncher for DaemonLauncher {
    async fn launch(&self) -> Result<Analyzer, InstrumentError> {
        let mut daemon = DaemonProcess::spawn(&self.config, &self.stdout_log).await?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, daemon.port()));
        let mut adapter = TcpLineAdapter::new(addr).with_timeout(self.config.reply_timeout());
        let policy = RetryPolicy::daemon_connect(&self.config);
        let connected = adapter
            .connect_with_retry(&policy, || {
                daemon
                    .exit_status()
                    .map(|status| format!("PTDaemon exited with {}", status))
            })
            .await;
        if let Err(e) = connected {
            daemon.terminate().await;
            return Err(e.into());
        }

        let settings = AnalyzerSettings::from(&self.config);
        Analyzer::connect(Box::new(adapter), Some(daemon), settings).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Instant;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake_ptd.sh");
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(executable: PathBuf, port: u16) -> PtdConfig {
        PtdConfig {
            executable,
            network_port: port,
            device_port: "/dev/null".to_string(),
            ..Default::default()
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[tokio::test]
    async fn test_port_in_use_fails_early() {
        let dir = TempDir::new().unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = config(script(&dir, "sleep 30"), port);
        let result = DaemonProcess::spawn(&cfg, &dir.path().join("ptd_stdout.log")).await;
        assert!(matches!(result, Err(InstrumentError::PortInUse(p)) if p == port));
    }

    #[tokio::test]
    async fn test_terminate_running_daemon() {
        let dir = TempDir::new().unwrap();
        let cfg = config(script(&dir, "exec sleep 30"), free_port());
        let mut daemon = DaemonProcess::spawn(&cfg, &dir.path().join("ptd_stdout.log"))
            .await
            .unwrap();
        assert!(daemon.exit_status().is_none());

        let start = Instant::now();
        daemon.terminate_within(Duration::from_secs(5)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(daemon.exit_status().is_some());
    }

    #[tokio::test]
    async fn test_daemon_output_and_args_logged() {
        let dir = TempDir::new().unwrap();
        let port = free_port();
        let cfg = config(script(&dir, "echo \"$@\" TZ=$TZ"), port);
        let log = dir.path().join("ptd_stdout.log");
        let mut daemon = DaemonProcess::spawn(&cfg, &log).await.unwrap();
        daemon.child.wait().await.unwrap();

        let output = fs::read_to_string(&log).unwrap();
        assert!(output.contains(&format!("-p {}", port)));
        assert!(output.contains("49 /dev/null"));
        assert!(output.contains("TZ=UTC"));
    }

    #[tokio::test]
    async fn test_launcher_aborts_when_daemon_exits() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(script(&dir, "exit 3"), free_port());
        cfg.connect_retries = 200;
        cfg.connect_retry_interval_ms = 20;

        let launcher = DaemonLauncher::new(cfg, dir.path());
        let start = Instant::now();
        let err = launcher.launch().await.err().unwrap();
        assert!(err.to_string().contains("exited"));
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
