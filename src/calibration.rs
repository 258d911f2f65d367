//! Calibration carried from the ranging phase into the testing phase.
//!
//! The testing range is the largest volts and amps seen while ranging,
//! multiplied by a headroom factor. Maxima come from an optional JSON file of
//! externally derived values keyed by run label:
//!
//! ```json
//! { "resnet50": { "maxAmps": 5.0, "maxVolts": 230.0 } }
//! ```
//!
//! and otherwise from the ranging phase's own `spl.txt`.

use crate::config::ConfigError;
use crate::error::{AppResult, DirectorError};
use crate::instrument::Range;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Max amps and volts observed while ranging
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    #[serde(rename = "maxAmps")]
    pub max_amps: f64,
    #[serde(rename = "maxVolts")]
    pub max_volts: f64,
}

impl CalibrationRecord {
    /// Both maxima multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            max_amps: self.max_amps * factor,
            max_volts: self.max_volts * factor,
        }
    }

    /// Range for the testing phase.
    pub fn testing_range(&self, factor: f64) -> Range {
        let scaled = self.scaled(factor);
        Range::explicit(scaled.max_volts, scaled.max_amps)
    }
}

/// Externally provided calibration records
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    records: HashMap<String, CalibrationRecord>,
}

impl CalibrationStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read a `{label: {maxAmps, maxVolts}}` JSON file.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| DirectorError::fs(path, e))?;
        let records: HashMap<String, CalibrationRecord> =
            serde_json::from_str(&text).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "Invalid calibration file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        info!(path = %path.display(), labels = records.len(), "Loaded calibration file");
        Ok(Self { records })
    }

    pub fn get(&self, label: &str) -> Option<CalibrationRecord> {
        self.records.get(label).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
