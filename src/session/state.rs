//! Session phase bookkeeping.
//!
//! Pure transition checks, kept apart from the side effects in
//! [`super::Session`] so the ordering rules can be tested on their own.

use crate::protocol::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Measurement phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Ranging,
    Testing,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Ranging, Phase::Testing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Ranging => "ranging",
            Phase::Testing => "testing",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ranging" => Ok(Phase::Ranging),
            "testing" => Ok(Phase::Testing),
            other => Err(ProtocolError::UnknownPhase(other.to_string())),
        }
    }
}

/// Where a session is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running(Phase),
    Stopped(Phase),
    Done,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Running(phase) => write!(f, "running {}", phase),
            SessionState::Stopped(phase) => write!(f, "stopped {}", phase),
            SessionState::Done => f.write_str("done"),
        }
    }
}

impl SessionState {
    /// May `phase` start now?
    ///
    /// `range_given` is true for testing starts that carry their own range
    /// (`auto` or explicit values) and so do not depend on ranging.
    pub fn check_start(&self, phase: Phase, range_given: bool) -> Result<(), ProtocolError> {
        let allowed = match (phase, *self) {
            (Phase::Ranging, SessionState::Idle) => true,
            (Phase::Testing, SessionState::Stopped(Phase::Ranging)) => true,
            (Phase::Testing, SessionState::Idle) => range_given,
            _ => false,
        };
        self.allow(allowed, &format!("start {}", phase))
    }

    pub fn check_stop(&self, phase: Phase) -> Result<(), ProtocolError> {
        self.allow(
            *self == SessionState::Running(phase),
            &format!("stop {}", phase),
        )
    }

    pub fn check_upload(&self, phase: Phase) -> Result<(), ProtocolError> {
        self.allow(
            *self == SessionState::Stopped(phase),
            &format!("upload {}", phase),
        )
    }

    pub fn check_done(&self) -> Result<(), ProtocolError> {
        self.allow(matches!(self, SessionState::Stopped(_)), "done")
    }

    /// The phase currently sampling, if any
    pub fn running_phase(&self) -> Option<Phase> {
        match self {
            SessionState::Running(phase) => Some(*phase),
            _ => None,
        }
    }

    fn allow(&self, allowed: bool, command: &str) -> Result<(), ProtocolError> {
        if allowed {
            Ok(())
        } else {
            Err(ProtocolError::OutOfOrder {
                command: command.to_string(),
                state: self.to_string(),
            })
        }
    }
}
