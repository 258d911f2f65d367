//! PTDaemon analyzer driver
//!
//! Translates measurement intents into the daemon's command grammar:
//!
//! | Intent            | Command(s)                         |
//! |-------------------|------------------------------------|
//! | greeting          | `Hello`                            |
//! | identify          | `Identify`                         |
//! | read ranges       | `RR`                               |
//! | set range         | `SR,V,<volts>` then `SR,A,<amps>`  |
//! | start logging     | `Go,<interval_ms>,<trigger>,<mark>`|
//! | stop logging      | `Stop`                             |
//!
//! Every command gets exactly one reply line. A reply containing `Error` is
//! treated as a rejection.

use super::{DaemonProcess, InstrumentError, Range, RangeValue};
use crate::adapters::LineAdapter;
use crate::config::PtdConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Greeting every PTDaemon answers `Hello` with.
pub const GREETING: &str = "Hello, PTDaemon here!";

/// Timing parameters of the analyzer
#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    /// Pause after a range change so the hardware can settle
    pub settle_delay: Duration,
    /// Sampling interval passed to `Go`
    pub sample_interval_ms: u32,
    /// Trigger value passed to `Go`
    pub trigger: u32,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(10),
            sample_interval_ms: 1000,
            trigger: 0,
        }
    }
}

impl From<&PtdConfig> for AnalyzerSettings {
    fn from(config: &PtdConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            sample_interval_ms: config.sample_interval_ms,
            trigger: config.trigger,
        }
    }
}

/// A connected PTDaemon and, when this process spawned it, the daemon itself
pub struct Analyzer {
    adapter: Box<dyn LineAdapter>,
    daemon: Option<DaemonProcess>,
    settings: AnalyzerSettings,
    identity: String,
    initial_range: Range,
    last_range: Option<String>,
    messages: u64,
}

impl Analyzer {
    /// Greet the daemon, record its identity and its initial ranges.
    ///
    /// # Arguments
    /// * `adapter` - Connected control channel
    /// * `daemon` - The daemon process, if owned by this analyzer
    /// * `settings` - Timing parameters
    pub async fn connect(
        adapter: Box<dyn LineAdapter>,
        daemon: Option<DaemonProcess>,
        settings: AnalyzerSettings,
    ) -> Result<Self, InstrumentError> {
        let mut analyzer = Self {
            adapter,
            daemon,
            settings,
            identity: String::new(),
            initial_range: Range::AUTO,
            last_range: None,
            messages: 0,
        };

        let greeting = analyzer.command("Hello").await?;
        if !greeting.starts_with(GREETING) {
            return Err(InstrumentError::NotPtDaemon(greeting));
        }
        analyzer.identify().await?;
        info!(identity = %analyzer.identity, "Connected to PTDaemon");

        let ranges = analyzer.command("RR").await?;
        analyzer.initial_range = parse_ranges(&ranges);
        info!(initial_range = %analyzer.initial_range, "Recorded initial analyzer range");

        Ok(analyzer)
    }

    /// Identity string reported by the daemon
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Ranges found on the analyzer at connect time
    pub fn initial_range(&self) -> Range {
        self.initial_range
    }

    /// Number of commands answered by the daemon so far
    pub fn messages(&self) -> u64 {
        self.messages
    }

    /// Ask the daemon to identify the analyzer.
    pub async fn identify(&mut self) -> Result<String, InstrumentError> {
        let identity = self.command("Identify").await?;
        self.identity = identity.clone();
        Ok(identity)
    }

    /// Set volts and amps ranges, then wait for the analyzer to settle.
    ///
    /// Returns `false` without talking to the daemon when `range` equals the
    /// last range issued.
    pub async fn set_range(&mut self, range: &Range) -> Result<bool, InstrumentError> {
        let key = range.to_string();
        if self.last_range.as_deref() == Some(key.as_str()) {
            debug!(range = %key, "Range unchanged, skipping");
            return Ok(false);
        }

        self.last_range = None;
        self.command(&format!("SR,V,{}", range.volts)).await?;
        self.command(&format!("SR,A,{}", range.amps)).await?;
        self.last_range = Some(key);

        if !self.settings.settle_delay.is_zero() {
            info!(delay = ?self.settings.settle_delay, "Waiting for the analyzer to settle");
            tokio::time::sleep(self.settings.settle_delay).await;
        }
        Ok(true)
    }

    /// Start sampling; every logged sample carries `mark`.
    pub async fn start_logging(&mut self, mark: &str) -> Result<(), InstrumentError> {
        let command = format!(
            "Go,{},{},{}",
            self.settings.sample_interval_ms, self.settings.trigger, mark
        );
        self.command(&command).await?;
        Ok(())
    }

    /// Stop sampling. The control connection stays open.
    pub async fn stop(&mut self) -> Result<(), InstrumentError> {
        self.command("Stop").await?;
        Ok(())
    }

    /// Put the initial ranges back, close the connection and terminate the
    /// daemon. Failures are logged, never returned.
    pub async fn release(&mut self) {
        let initial = self.initial_range;
        for command in [
            format!("SR,V,{}", initial.volts),
            format!("SR,A,{}", initial.amps),
        ] {
            if let Err(e) = self.command(&command).await {
                warn!(command = %command, error = %e, "Could not restore initial range");
                break;
            }
        }
        self.discard().await;
    }

    /// Close the connection and terminate the daemon without talking to it.
    ///
    /// Used after a transport fault, when the daemon's state is unknown.
    pub async fn discard(&mut self) {
        self.last_range = None;
        if let Err(e) = self.adapter.disconnect().await {
            warn!(error = %e, "Failed to close daemon connection");
        }
        if let Some(mut daemon) = self.daemon.take() {
            daemon.terminate().await;
        }
    }

    async fn command(&mut self, command: &str) -> Result<String, InstrumentError> {
        if let Some(daemon) = self.daemon.as_mut() {
            if let Some(status) = daemon.exit_status() {
                return Err(InstrumentError::DaemonExited(status));
            }
        }

        info!(command, "Sending to PTDaemon");
        let reply = self.adapter.query(command).await?;
        self.messages += 1;
        info!(reply = %reply, "PTDaemon replied");

        if reply.contains("Error") {
            return Err(InstrumentError::Rejected {
                command: command.to_string(),
                reply,
            });
        }
        Ok(reply)
    }
}

/// Parse `Ranges,<ampAuto>,<amps>,<voltAuto>,<volts>`.
///
/// Autorange flags are `1` enabled, `0` disabled, `-1` unknown. A quantity
/// is only fixed when its autorange is disabled and the range is positive.
pub fn parse_ranges(reply: &str) -> Range {
    let fields: Vec<&str> = reply.trim().split(',').collect();
    let value_at = |index: usize, name: &str| -> RangeValue {
        let auto = fields.get(index).copied();
        let value = fields.get(index + 1).and_then(|v| v.parse::<f64>().ok());
        match (auto, value) {
            (Some("0"), Some(v)) if v > 0.0 => RangeValue::Fixed(v),
            (Some(_), Some(_)) => RangeValue::Auto,
            _ => {
                warn!(reply, "Can not read the initial {} range", name);
                RangeValue::Auto
            }
        }
    };
    Range {
        amps: value_at(1, "amps"),
        volts: value_at(3, "volts"),
    }
}
