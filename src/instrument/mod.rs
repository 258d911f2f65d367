//! Instrument daemon control
//!
//! The power analyzer is driven through PTDaemon, a separate process that
//! owns the device and exposes a line protocol on a local TCP port. This
//! module owns both halves:
//!
//! - [`daemon`]: spawning and terminating the daemon process
//! - [`ptd`]: the [`Analyzer`] speaking the daemon's command grammar
//! - [`log_slice`]: cutting one run's samples out of the daemon's raw log
//!
//! The analyzer is a process-wide resource. It sits behind an
//! [`InstrumentHandle`]; a session takes an [`InstrumentLease`] for its whole
//! lifetime, which serializes daemon commands and keeps a second connection
//! from starting a session concurrently.

pub mod daemon;
pub mod log_slice;
pub mod ptd;

pub use daemon::{DaemonLauncher, DaemonProcess};
pub use ptd::{Analyzer, AnalyzerSettings};

use crate::adapters::{AdapterError, MockAdapter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

/// Errors raised while driving the instrument daemon
#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("Daemon I/O failed: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Peer is not PTDaemon, greeting was '{0}'")]
    NotPtDaemon(String),

    #[error("Daemon rejected '{command}': {reply}")]
    Rejected { command: String, reply: String },

    #[error("Failed to spawn daemon: {0}")]
    Spawn(String),

    #[error("Daemon control port {0} is already in use")]
    PortInUse(u16),

    #[error("Daemon exited unexpectedly: {0}")]
    DaemonExited(String),

    #[error("Instrument is in use by another session")]
    Busy,
}

impl InstrumentError {
    /// True when the control channel or the daemon itself is gone, so the
    /// analyzer must be replaced before the next command.
    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Adapter(_) | Self::DaemonExited(_))
    }
}

/// Range to use during the ranging phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangingMode {
    /// Both ranges on autorange
    #[default]
    Auto,
    /// Current range pinned to the device maximum, volts on autorange
    Max,
}

/// One range setting for a single quantity
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeValue {
    Auto,
    Fixed(f64),
}

impl fmt::Display for RangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeValue::Auto => write!(f, "Auto"),
            RangeValue::Fixed(value) => write!(f, "{}", format_number(*value)),
        }
    }
}

/// Volts and amps range pair sent with `SR`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Range {
    pub volts: RangeValue,
    pub amps: RangeValue,
}

impl Range {
    pub const AUTO: Range = Range {
        volts: RangeValue::Auto,
        amps: RangeValue::Auto,
    };

    pub fn explicit(volts: f64, amps: f64) -> Self {
        Self {
            volts: RangeValue::Fixed(volts),
            amps: RangeValue::Fixed(amps),
        }
    }

    /// Range for the ranging phase of the given device.
    pub fn for_ranging(mode: RangingMode, device_type: u32) -> Self {
        match mode {
            RangingMode::Auto => Self::AUTO,
            RangingMode::Max => match max_amps_for_device(device_type) {
                Some(amps) => Self {
                    volts: RangeValue::Auto,
                    amps: RangeValue::Fixed(amps),
                },
                None => {
                    warn!(
                        device_type,
                        "No maximum current range known for device, ranging on Auto"
                    );
                    Self::AUTO
                }
            },
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V={},A={}", self.volts, self.amps)
    }
}

/// Maximum current range in amps for analyzers that support pinned ranging.
pub fn max_amps_for_device(device_type: u32) -> Option<f64> {
    match device_type {
        8 | 49 | 52 | 77 => Some(20.0),
        35 | 48 => Some(40.0),
        47 => Some(50.0),
        66 => Some(30.0),
        // DC variants
        508 | 549 | 586 => Some(20.0),
        _ => None,
    }
}

/// Render a range value the way the daemon accepts it: at most four
/// decimals, no trailing zeros.
pub fn format_number(value: f64) -> String {
    let text = format!("{:.4}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-" {
        "0".to_string()
    } else {
        text.to_string()
    }
}

/// Produces a ready-to-use analyzer on first use in a session
#[async_trait]
pub trait AnalyzerLauncher: Send + Sync {
    async fn launch(&self) -> Result<Analyzer, InstrumentError>;
}

/// Process-wide owner of the analyzer
#[derive(Clone)]
pub struct InstrumentHandle {
    slot: Arc<Mutex<Option<Analyzer>>>,
    launcher: Arc<dyn AnalyzerLauncher>,
}

impl InstrumentHandle {
    pub fn new(launcher: Arc<dyn AnalyzerLauncher>) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            launcher,
        }
    }

    /// Claim exclusive use of the analyzer without waiting.
    pub fn try_lease(&self) -> Result<InstrumentLease, InstrumentError> {
        let guard = self
            .slot
            .clone()
            .try_lock_owned()
            .map_err(|_| InstrumentError::Busy)?;
        Ok(InstrumentLease {
            guard,
            launcher: self.launcher.clone(),
        })
    }

    pub fn is_leased(&self) -> bool {
        self.slot.try_lock().is_err()
    }

    /// Restore and stop a daemon left running between sessions.
    pub async fn shutdown(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(mut analyzer) = slot.take() {
            analyzer.release().await;
        }
    }
}

/// Exclusive access to the analyzer, held by one session
///
/// Dropping the lease frees the instrument for the next session; a running
/// daemon stays up unless [`InstrumentLease::release`] was called.
pub struct InstrumentLease {
    guard: OwnedMutexGuard<Option<Analyzer>>,
    launcher: Arc<dyn AnalyzerLauncher>,
}

impl InstrumentLease {
    /// The analyzer, launching the daemon on first use.
    pub async fn analyzer(&mut self) -> Result<&mut Analyzer, InstrumentError> {
        if self.guard.is_none() {
            let analyzer = self.launcher.launch().await?;
            *self.guard = Some(analyzer);
        }
        self.guard
            .as_mut()
            .ok_or_else(|| InstrumentError::DaemonExited("analyzer unavailable".to_string()))
    }

    /// The analyzer if it is already running.
    pub fn active(&mut self) -> Option<&mut Analyzer> {
        self.guard.as_mut()
    }

    /// Restore the initial ranges and terminate the daemon.
    pub async fn release(&mut self) {
        if let Some(mut analyzer) = self.guard.take() {
            analyzer.release().await;
            info!("Instrument released");
        }
    }

    /// Drop a faulted analyzer; the next [`InstrumentLease::analyzer`] call
    /// launches a fresh one.
    pub async fn discard(&mut self) {
        if let Some(mut analyzer) = self.guard.take() {
            analyzer.discard().await;
            warn!("Instrument discarded after a fault");
        }
    }
}

/// Launcher handing out analyzers backed by a shared [`MockAdapter`]
///
/// Used by tests and dry runs; every launch reuses the same mock so its call
/// log spans the whole process.
pub struct MockLauncher {
    adapter: MockAdapter,
    settings: AnalyzerSettings,
    launches: AtomicUsize,
}

impl MockLauncher {
    pub fn new(adapter: MockAdapter, settings: AnalyzerSettings) -> Self {
        Self {
            adapter,
            settings,
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalyzerLauncher for MockLauncher {
    async fn launch(&self) -> Result<Analyzer, InstrumentError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.adapter.set_connected(true);
        Analyzer::connect(Box::new(self.adapter.clone()), None, self.settings.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn launcher() -> Arc<MockLauncher> {
        let settings = AnalyzerSettings {
            settle_delay: Duration::ZERO,
            ..Default::default()
        };
        Arc::new(MockLauncher::new(MockAdapter::new(), settings))
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(5.0 * 1.1), "5.5");
        assert_eq!(format_number(230.0 * 1.1), "253");
        assert_eq!(format_number(20.0), "20");
        assert_eq!(format_number(0.125), "0.125");
        assert_eq!(format_number(0.0), "0");
    }

    #[test]
    fn test_ranging_range_per_mode() {
        assert_eq!(Range::for_ranging(RangingMode::Auto, 49), Range::AUTO);
        let max = Range::for_ranging(RangingMode::Max, 47);
        assert_eq!(max.volts, RangeValue::Auto);
        assert_eq!(max.amps, RangeValue::Fixed(50.0));
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_unknown_device_falls_back_to_auto() {
        assert_eq!(Range::for_ranging(RangingMode::Max, 9999), Range::AUTO);
        assert!(logs_contain("No maximum current range known"));
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let launcher = launcher();
        let handle = InstrumentHandle::new(launcher.clone());
        let lease = handle.try_lease().unwrap();
        assert!(handle.is_leased());
        assert!(matches!(handle.try_lease(), Err(InstrumentError::Busy)));
        drop(lease);
        assert!(handle.try_lease().is_ok());
    }

    #[tokio::test]
    async fn test_analyzer_launched_lazily_and_kept() {
        let launcher = launcher();
        let handle = InstrumentHandle::new(launcher.clone());

        let mut lease = handle.try_lease().unwrap();
        assert!(lease.active().is_none());
        lease.analyzer().await.unwrap();
        lease.analyzer().await.unwrap();
        drop(lease);

        let mut lease = handle.try_lease().unwrap();
        assert!(lease.active().is_some());
        assert_eq!(launcher.launches(), 1);

        lease.release().await;
        assert!(lease.active().is_none());
    }

    #[test]
    fn test_fault_classification() {
        assert!(InstrumentError::Adapter(AdapterError::Closed).is_fault());
        assert!(InstrumentError::DaemonExited("signal 9".into()).is_fault());
        assert!(!InstrumentError::Busy.is_fault());
        assert!(!InstrumentError::Rejected {
            command: "SR,A,5".into(),
            reply: "Error: bad range".into(),
        }
        .is_fault());
    }

    #[tokio::test]
    async fn test_discarded_analyzer_is_relaunched() {
        let launcher = launcher();
        let handle = InstrumentHandle::new(launcher.clone());

        let mut lease = handle.try_lease().unwrap();
        lease.analyzer().await.unwrap();
        lease.discard().await;
        assert!(lease.active().is_none());

        lease.analyzer().await.unwrap();
        assert_eq!(launcher.launches(), 2);
    }
}
