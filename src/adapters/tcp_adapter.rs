use super::{AdapterError, LineAdapter};
use crate::error_recovery::RetryPolicy;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// TCP adapter for the instrument daemon's control port
///
/// Commands are CRLF terminated. Every reply is one line, read with a
/// bounded timeout.
pub struct TcpLineAdapter {
    /// Control port address, normally `127.0.0.1:<port>`
    addr: SocketAddr,

    /// Upper bound for a single reply
    timeout: Duration,

    stream: Option<BufReader<TcpStream>>,
}

impl TcpLineAdapter {
    /// Create an unconnected adapter with default settings
    ///
    /// # Arguments
    /// * `addr` - Control port address of the daemon
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(5),
            stream: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Open the control connection once.
    pub async fn connect(&mut self) -> Result<(), AdapterError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(|e| AdapterError::ConnectionFailed(format!("{}: {}", self.addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| AdapterError::ConnectionFailed(e.to_string()))?;
        self.stream = Some(BufReader::new(stream));
        debug!(addr = %self.addr, "Control connection opened");
        Ok(())
    }

    /// Connect, retrying according to `policy`.
    ///
    /// Before every attempt `give_up` is polled; when it returns a reason the
    /// loop stops immediately with that reason (the daemon process died).
    pub async fn connect_with_retry<F>(
        &mut self,
        policy: &RetryPolicy,
        mut give_up: F,
    ) -> Result<(), AdapterError>
    where
        F: FnMut() -> Option<String> + Send,
    {
        let mut last_error = None;
        for attempt in 1..=policy.max_attempts {
            if let Some(reason) = give_up() {
                return Err(AdapterError::ConnectionFailed(reason));
            }
            match self.connect().await {
                Ok(()) => {
                    info!(addr = %self.addr, attempt, "Connected to instrument daemon");
                    return Ok(());
                }
                Err(e) => {
                    debug!(addr = %self.addr, attempt, error = %e, "Connect attempt failed");
                    last_error = Some(e);
                }
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.backoff_delay).await;
            }
        }
        Err(AdapterError::ConnectionFailed(format!(
            "gave up after {} attempts: {}",
            policy.max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    async fn write_line(&mut self, command: &str) -> Result<(), AdapterError> {
        let line = format!("{}\r\n", command);
        let stream = self.stream.as_mut().ok_or(AdapterError::NotConnected)?;
        if let Err(e) = stream.get_mut().write_all(line.as_bytes()).await {
            self.stream = None;
            return Err(AdapterError::SendFailed(e.to_string()));
        }
        debug!("Sent daemon command: {}", command);
        Ok(())
    }
}

#[async_trait]
impl LineAdapter for TcpLineAdapter {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.get_mut().shutdown().await;
            debug!(addr = %self.addr, "Control connection closed");
        }
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        self.write_line(command).await?;

        let timeout = self.timeout;
        let stream = self.stream.as_mut().ok_or(AdapterError::NotConnected)?;
        let mut reply = String::new();
        let read = match tokio::time::timeout(timeout, stream.read_line(&mut reply)).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                self.stream = None;
                return Err(AdapterError::QueryFailed(e.to_string()));
            }
            Err(_) => {
                // a late reply would be taken as the answer to the next command
                warn!(addr = %self.addr, command, ?timeout, "Reply timed out, dropping connection");
                self.stream = None;
                return Err(AdapterError::Timeout(timeout));
            }
        };
        if read == 0 {
            self.stream = None;
            return Err(AdapterError::Closed);
        }

        let reply = reply.trim_end_matches(['\r', '\n']).to_string();
        debug!("Received daemon reply: {}", reply);
        Ok(reply)
    }
}
