//! `<id>_session.json`: what happened during one session.

use super::Phase;
use crate::calibration::CalibrationRecord;
use crate::error::{AppResult, DirectorError};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use uuid::Uuid;

/// Record of one measurement phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    /// Range issued before sampling started, e.g. `V=Auto,A=20`
    pub range: String,
    pub started: DateTime<Local>,
    pub stopped: Option<DateTime<Local>>,
    /// Lines in the phase's `spl.txt`
    pub samples: Option<usize>,
    /// Stored upload, relative to the output directory
    pub upload: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub id: String,
    pub label: String,
    pub server_uuid: Uuid,
    pub client_uuid: Option<String>,
    pub created: DateTime<Local>,
    pub finished: Option<DateTime<Local>>,
    pub aborted: bool,
    pub analyzer: Option<String>,
    pub calibration: Option<CalibrationRecord>,
    pub phases: Vec<PhaseRecord>,
    pub daemon_messages: u64,
}

impl SessionManifest {
    pub fn new(id: &str, label: &str, client_uuid: Option<String>, created: DateTime<Local>) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            server_uuid: Uuid::new_v4(),
            client_uuid,
            created,
            finished: None,
            aborted: false,
            analyzer: None,
            calibration: None,
            phases: Vec::new(),
            daemon_messages: 0,
        }
    }

    pub fn phase_mut(&mut self, phase: Phase) -> Option<&mut PhaseRecord> {
        self.phases.iter_mut().rev().find(|p| p.phase == phase)
    }

    /// Write pretty JSON through a temp file and rename.
    pub fn write(&self, path: &Path) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DirectorError::fs(path, std::io::Error::other(e)))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(|e| DirectorError::fs(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| DirectorError::fs(path, e))
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| DirectorError::fs(path, e))?;
        serde_json::from_str(&text).map_err(|e| DirectorError::fs(path, std::io::Error::other(e)))
    }
}
