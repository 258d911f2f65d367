//! Line-oriented adapters
//!
//! This module contains implementations of the `LineAdapter` trait, the
//! low-level I/O abstraction used to talk to the instrument daemon. The daemon
//! speaks a request/reply grammar of single ASCII lines, so the trait only
//! needs a one-reply `query`.

pub mod mock_adapter;
pub mod tcp_adapter;

pub use mock_adapter::MockAdapter;
pub use tcp_adapter::TcpLineAdapter;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by adapter I/O
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Adapter is not connected")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Peer closed the connection")]
    Closed,
}

/// Async adapter for a line-based request/reply peer
#[async_trait]
pub trait LineAdapter: Send {
    /// Short name used in log output
    fn name(&self) -> &str;

    /// Close the connection. Further calls fail with `NotConnected`.
    async fn disconnect(&mut self) -> Result<(), AdapterError>;

    /// Send one command line and read exactly one reply line
    ///
    /// A timeout or read failure leaves the peer's reply unaccounted for,
    /// so the connection is dropped and later calls fail with
    /// `NotConnected`.
    async fn query(&mut self, command: &str) -> Result<String, AdapterError>;
}
