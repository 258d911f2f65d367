//! Client side of the director protocol
//!
//! Runs on the system under test. [`DirectorClient`] speaks the line
//! protocol; [`run`] drives a whole measurement: hello, new session, then for
//! each phase a clock check, `start`, the workload, `stop` and an optional
//! log upload, and finally `done`.

pub mod workload;

pub use workload::{ShellWorkload, Workload};

use crate::bundle;
use crate::config::{ClientConfig, ConfigError};
use crate::error::{AppResult, DirectorError};
use crate::liveness::KeepaliveConfig;
use crate::protocol::{
    self, ProtocolError, Request, RequestedRange, Response, SessionCommand, PROTOCOL_NAME,
};
use crate::session::Phase;
use crate::transfer;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A connection to the director
pub struct DirectorClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl DirectorClient {
    pub async fn connect(addr: &str) -> AppResult<Self> {
        let stream = TcpStream::connect(addr).await?;
        if let Err(e) = KeepaliveConfig::default().apply(&stream) {
            warn!(error = %e, "Could not enable keepalive");
        }
        info!(addr, "Connected to director");
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Send `request` and wait for its response.
    ///
    /// `ERR` becomes [`DirectorError::Rejected`].
    pub async fn request(&mut self, request: &Request) -> AppResult<Option<String>> {
        self.send(request).await?;
        self.response(request).await
    }

    async fn send(&mut self, request: &Request) -> AppResult<()> {
        let line = request.to_string();
        debug!(command = %line, "Sending");
        protocol::write_line(&mut self.writer, &line).await?;
        Ok(())
    }

    async fn response(&mut self, request: &Request) -> AppResult<Option<String>> {
        let line = protocol::read_line(&mut self.reader)
            .await?
            .ok_or(DirectorError::ConnectionClosed)?;
        match Response::parse(&line)? {
            Response::Ok(payload) => Ok(payload),
            Response::Err(message) => Err(DirectorError::Rejected {
                command: request.to_string(),
                message,
            }),
        }
    }

    /// Greet the server and return its protocol version.
    pub async fn hello(&mut self) -> AppResult<String> {
        let version = self.request(&Request::Hello).await?.unwrap_or_default();
        if !version.starts_with(PROTOCOL_NAME) {
            return Err(ProtocolError::UnexpectedReply(version).into());
        }
        info!(%version, "Director greeted");
        Ok(version)
    }

    /// Open a session and return its id.
    pub async fn new_session(&mut self, label: &str, client_uuid: Option<String>) -> AppResult<String> {
        let request = Request::New {
            label: label.to_string(),
            client_uuid,
        };
        self.request(&request)
            .await?
            .ok_or_else(|| ProtocolError::UnexpectedReply("OK without session id".to_string()).into())
    }

    /// The server's clock, in Unix seconds.
    pub async fn server_time(&mut self) -> AppResult<f64> {
        let payload = self.request(&Request::Time).await?.unwrap_or_default();
        payload
            .trim()
            .parse()
            .map_err(|_| ProtocolError::UnexpectedReply(payload).into())
    }

    /// Compare clocks; more than `max_drift` apart is fatal.
    ///
    /// Returns the drift in seconds, positive when the server is ahead.
    pub async fn check_time(&mut self, max_drift: Duration) -> AppResult<f64> {
        let before = Utc::now();
        let server = self.server_time().await?;
        let after = Utc::now();

        let drift = clock_drift(before, server, after);
        let drift_ms = drift.abs() * 1000.0;
        if drift_ms > max_drift.as_millis() as f64 {
            return Err(DirectorError::TimeSync {
                drift_ms,
                max_ms: max_drift.as_millis() as u64,
            });
        }
        debug!(drift_ms, "Clock check passed");
        Ok(drift)
    }

    pub async fn start(
        &mut self,
        id: &str,
        phase: Phase,
        range: Option<RequestedRange>,
    ) -> AppResult<()> {
        self.session(id, SessionCommand::Start { phase, range }).await
    }

    pub async fn stop(&mut self, id: &str, phase: Phase) -> AppResult<()> {
        self.session(id, SessionCommand::Stop(phase)).await
    }

    pub async fn done(&mut self, id: &str) -> AppResult<()> {
        self.session(id, SessionCommand::Done).await
    }

    async fn session(&mut self, id: &str, command: SessionCommand) -> AppResult<()> {
        let request = Request::Session {
            id: id.to_string(),
            command,
        };
        self.request(&request).await.map(|_| ())
    }

    /// Upload `archive` as the phase's log bundle.
    pub async fn upload(&mut self, id: &str, phase: Phase, archive: &Path) -> AppResult<u64> {
        let request = Request::Session {
            id: id.to_string(),
            command: SessionCommand::Upload(phase),
        };
        self.send(&request).await?;
        let bytes = transfer::send_file(&mut self.writer, archive).await?;
        self.response(&request).await?;
        info!(session = id, %phase, bytes, "Log bundle uploaded");
        Ok(bytes)
    }

    /// Fetch `file` of a finished session into `dest`.
    pub async fn download(&mut self, id: &str, file: &str, dest: &Path) -> AppResult<u64> {
        let request = Request::Download {
            id: id.to_string(),
            file: file.to_string(),
        };
        self.request(&request).await?;
        let bytes = transfer::recv_file(&mut self.reader, dest).await?;
        info!(session = id, file, bytes, "Downloaded");
        Ok(bytes)
    }

    /// Remove a finished session's output on the server.
    pub async fn cleanup(&mut self, id: &str) -> AppResult<()> {
        self.request(&Request::Cleanup { id: id.to_string() })
            .await
            .map(|_| ())
    }

    /// Ask the server to exit once this connection closes.
    pub async fn stop_server(&mut self) -> AppResult<()> {
        self.request(&Request::Stop).await.map(|_| ())
    }
}

/// Server time minus the midpoint of the local request window, in seconds.
fn clock_drift(before: DateTime<Utc>, server: f64, after: DateTime<Utc>) -> f64 {
    let local = |t: DateTime<Utc>| t.timestamp() as f64 + f64::from(t.timestamp_subsec_micros()) / 1e6;
    let midpoint = (local(before) + local(after)) / 2.0;
    server - midpoint
}

/// What a completed run produced
#[derive(Debug, Clone)]
pub struct RunReport {
    pub session_id: String,
    pub phases: Vec<Phase>,
    /// Local per-phase directories holding the workload logs
    pub phase_dirs: Vec<PathBuf>,
}

/// Drive one full measurement run against the configured director.
pub async fn run(config: &ClientConfig, workload: &dyn Workload) -> AppResult<RunReport> {
    check_paths(config)?;
    fs::create_dir_all(&config.output).map_err(|e| DirectorError::fs(&config.output, e))?;

    let mut client = DirectorClient::connect(&config.server_addr).await?;
    client.hello().await?;
    let session_id = client
        .new_session(&config.label, Some(Uuid::new_v4().to_string()))
        .await?;
    info!(session = %session_id, "Session opened");

    let phases: &[Phase] = if config.ranging_only {
        &[Phase::Ranging]
    } else {
        &Phase::ALL
    };
    let max_drift = Duration::from_millis(config.max_time_drift_ms);

    let mut phase_dirs = Vec::new();
    for &phase in phases {
        client.check_time(max_drift).await?;
        let dir = run_phase(&mut client, config, workload, &session_id, phase).await?;
        phase_dirs.push(dir);
    }

    client.done(&session_id).await?;
    info!(session = %session_id, "Session done");
    if config.stop_server {
        client.stop_server().await?;
    }

    Ok(RunReport {
        session_id,
        phases: phases.to_vec(),
        phase_dirs,
    })
}

async fn run_phase(
    client: &mut DirectorClient,
    config: &ClientConfig,
    workload: &dyn Workload,
    id: &str,
    phase: Phase,
) -> AppResult<PathBuf> {
    let loadgen = &config.loadgen_logs;
    fs::create_dir_all(loadgen).map_err(|e| DirectorError::fs(loadgen, e))?;

    client.start(id, phase, None).await?;
    let outcome = workload.run(phase, loadgen).await;
    client.stop(id, phase).await?;

    let status = outcome?;
    if !status.success() {
        if config.fail_on_workload_error {
            return Err(DirectorError::Workload(format!(
                "{} workload exited with {}",
                phase, status
            )));
        }
        warn!(session = id, %phase, %status, "Workload failed, continuing");
    }

    let phase_dir = config.output.join(format!("{}_{}", id, phase));
    fs::create_dir_all(&phase_dir).map_err(|e| DirectorError::fs(&phase_dir, e))?;
    let kept = phase_dir.join("loadgen");
    fs::rename(loadgen, &kept).map_err(|e| DirectorError::fs(loadgen, e))?;

    if config.send_logs {
        let archive = phase_dir.join(format!("{}_logs.zip", phase));
        let (src, dest) = (kept.clone(), archive.clone());
        let files = tokio::task::spawn_blocking(move || bundle::zip_dir(&src, &dest))
            .await
            .map_err(|e| DirectorError::fs(&archive, std::io::Error::other(e)))?
            .map_err(|e| DirectorError::fs(&archive, e))?;
        debug!(session = id, %phase, files, "Log bundle packed");
        client.upload(id, phase, &archive).await?;
    }
    Ok(phase_dir)
}

/// The loadgen logs directory must not be, or contain, the output
/// directory, and must not exist yet unless `force` allows removing it.
pub fn check_paths(config: &ClientConfig) -> AppResult<()> {
    let loadgen = absolute(&config.loadgen_logs)?;
    let output = absolute(&config.output)?;
    if output.starts_with(&loadgen) {
        return Err(ConfigError::ValidationError(format!(
            "Output dir {} must be outside the loadgen logs dir {}",
            output.display(),
            loadgen.display()
        ))
        .into());
    }

    if loadgen.exists() {
        if !config.force {
            return Err(ConfigError::ValidationError(format!(
                "Loadgen logs dir {} already exists; remove it or set 'force'",
                loadgen.display()
            ))
            .into());
        }
        warn!(path = %loadgen.display(), "Removing existing loadgen logs dir");
        fs::remove_dir_all(&loadgen).map_err(|e| DirectorError::fs(&loadgen, e))?;
    }
    Ok(())
}

fn absolute(path: &Path) -> AppResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|e| DirectorError::fs(path, e))?;
    Ok(cwd.join(path))
}
