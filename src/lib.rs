//! Core library for the ptd_director power measurement director.
//!
//! A director server sits next to a power analyzer and drives it through
//! PTDaemon; a client on the system under test connects to it, runs a
//! workload once to find the analyzer range and once more to measure on that
//! range, and the server keeps each phase's samples. Both binaries are thin
//! wrappers around this crate.

pub mod adapters;
pub mod bundle;
pub mod calibration;
pub mod client;
pub mod config;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod liveness;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;
