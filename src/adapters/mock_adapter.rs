//! Mock line adapter for testing
//!
//! This adapter stands in for the instrument daemon's control connection so
//! the analyzer can be tested without the daemon. It provides:
//! - Canned replies that imitate the daemon
//! - Per-command reply overrides
//! - Controllable failure injection
//! - Call logging for test verification

use super::{AdapterError, LineAdapter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Mock line adapter for testing
///
/// Clones share state, so a test can keep one clone for inspection while the
/// analyzer owns another.
///
/// # Example
///
/// ```
/// use ptd_director::adapters::MockAdapter;
///
/// let adapter = MockAdapter::new().with_reply("Identify", "WT310");
/// assert!(adapter.call_log().is_empty());
/// ```
#[derive(Clone)]
pub struct MockAdapter {
    connected: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    replies: Arc<Mutex<HashMap<String, String>>>,
    call_log: Arc<Mutex<Vec<String>>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// Create a connected mock that answers like an idle daemon
    pub fn new() -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(true)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            replies: Arc::new(Mutex::new(HashMap::new())),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Override the reply for commands whose verb (text before the first
    /// comma) equals `verb`
    pub fn with_reply(self, verb: &str, reply: &str) -> Self {
        self.set_reply(verb, reply);
        self
    }

    pub fn set_reply(&self, verb: &str, reply: &str) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.insert(verb.to_string(), reply.to_string());
        }
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Set the connection state manually
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<String> {
        self.call_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        if let Ok(mut log) = self.call_log.lock() {
            log.clear();
        }
    }

    fn log_call(&self, call: &str) {
        if let Ok(mut log) = self.call_log.lock() {
            log.push(call.to_string());
        }
    }

    fn reply_for(&self, command: &str) -> String {
        let verb = command.split(',').next().unwrap_or(command);
        if let Some(reply) = self.replies.lock().ok().and_then(|r| r.get(verb).cloned()) {
            return reply;
        }
        match verb {
            "Hello" => "Hello, PTDaemon here!".to_string(),
            "Identify" => "MockMeter,1.0".to_string(),
            "RR" => "Ranges,1,-1.0,1,-1.0".to_string(),
            "Go" => "Starting untimed measurement".to_string(),
            "Stop" => "Stopping untimed measurement".to_string(),
            "SR" => format!("Range {} set", &command[3.min(command.len())..]),
            _ => "OK".to_string(),
        }
    }

    fn check_ready(&self) -> Result<(), AdapterError> {
        if self.check_failure() {
            return Err(AdapterError::QueryFailed("Injected failure".to_string()));
        }
        if !self.is_connected() {
            return Err(AdapterError::NotConnected);
        }
        Ok(())
    }
}

#[async_trait]
impl LineAdapter for MockAdapter {
    fn name(&self) -> &str {
        "mock"
    }

    async fn disconnect(&mut self) -> Result<(), AdapterError> {
        self.log_call("disconnect");
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, AdapterError> {
        self.log_call(command);
        self.check_ready()?;
        Ok(self.reply_for(command))
    }
}
