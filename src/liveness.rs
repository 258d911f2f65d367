//! Dead-peer detection on the command connection.
//!
//! Between commands the connection can sit idle for as long as a workload
//! runs, so application-level timeouts do not work. Instead both ends turn on
//! TCP keepalive with short timers: after `idle` without traffic the kernel
//! sends up to `count` keepalive segments `interval` apart, and a peer that
//! answers none of them makes the next read fail.

use crate::config::KeepaliveSettings;
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Keepalive timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
    pub count: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(2),
            interval: Duration::from_secs(2),
            count: 10,
        }
    }
}

impl From<&KeepaliveSettings> for KeepaliveConfig {
    fn from(settings: &KeepaliveSettings) -> Self {
        Self {
            idle: Duration::from_millis(settings.idle_ms),
            interval: Duration::from_millis(settings.interval_ms),
            count: settings.count,
        }
    }
}

impl KeepaliveConfig {
    /// Worst-case time until a silently dead peer is noticed
    pub fn detection_time(&self) -> Duration {
        self.idle + self.interval * self.count
    }

    /// Enable keepalive on `stream` with these timers.
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        self.apply_platform(stream)?;
        debug!(
            idle = ?self.idle,
            interval = ?self.interval,
            count = self.count,
            "TCP keepalive enabled"
        );
        Ok(())
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn apply_platform(&self, stream: &TcpStream) -> io::Result<()> {
        use nix::sys::socket::{setsockopt, sockopt};

        setsockopt(stream, sockopt::KeepAlive, &true).map_err(io::Error::from)?;
        setsockopt(stream, sockopt::TcpKeepIdle, &secs(self.idle)).map_err(io::Error::from)?;
        setsockopt(stream, sockopt::TcpKeepInterval, &secs(self.interval))
            .map_err(io::Error::from)?;
        setsockopt(stream, sockopt::TcpKeepCount, &self.count).map_err(io::Error::from)?;
        Ok(())
    }

    #[cfg(all(unix, not(any(target_os = "linux", target_os = "android"))))]
    fn apply_platform(&self, stream: &TcpStream) -> io::Result<()> {
        use nix::sys::socket::{setsockopt, sockopt};

        setsockopt(stream, sockopt::KeepAlive, &true).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn apply_platform(&self, _stream: &TcpStream) -> io::Result<()> {
        tracing::warn!("TCP keepalive timers not supported on this platform");
        Ok(())
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn secs(duration: Duration) -> u32 {
    duration.as_secs().clamp(1, u32::MAX as u64) as u32
}
