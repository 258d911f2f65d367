//! Shared fixtures: a fake PTDaemon over TCP and an in-process director.

#![allow(dead_code)]

use async_trait::async_trait;
use ptd_director::adapters::TcpLineAdapter;
use ptd_director::calibration::CalibrationStore;
use ptd_director::error::AppResult;
use ptd_director::instrument::{
    Analyzer, AnalyzerLauncher, AnalyzerSettings, InstrumentError, InstrumentHandle, RangingMode,
};
use ptd_director::server::Server;
use ptd_director::session::SessionContext;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Sample values the fake daemon logs for every `Go`
pub const SAMPLES: &[(f64, f64)] = &[(229.0, 4.0), (230.0, 5.0), (228.5, 4.5)];

/// A PTDaemon stand-in: answers the control grammar and appends marked
/// sample lines to the raw log whenever logging starts.
pub struct FakePtd {
    pub addr: SocketAddr,
    pub raw_log: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    crash_on_stop: Arc<AtomicBool>,
}

impl FakePtd {
    pub async fn start(raw_log: PathBuf) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let commands = Arc::new(Mutex::new(Vec::new()));

        let crash_on_stop = Arc::new(AtomicBool::new(false));

        let log = raw_log.clone();
        let seen = commands.clone();
        let crash = crash_on_stop.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_fake(stream, log.clone(), seen.clone(), crash.clone()));
            }
        });

        Self {
            addr,
            raw_log,
            commands,
            crash_on_stop,
        }
    }

    /// Close the control connection instead of answering the next `Stop`.
    pub fn crash_on_next_stop(&self) {
        self.crash_on_stop.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

async fn serve_fake(
    stream: TcpStream,
    raw_log: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    crash_on_stop: Arc<AtomicBool>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        commands.lock().unwrap().push(line.clone());
        let verb = line.split(',').next().unwrap_or_default();
        if verb == "Stop" && crash_on_stop.swap(false, Ordering::SeqCst) {
            return;
        }
        let reply = match verb {
            "Hello" => "Hello, PTDaemon here!".to_string(),
            "Identify" => "FakeMeter,WT310,1.0".to_string(),
            "RR" => "Ranges,1,-1.0,1,-1.0".to_string(),
            "SR" => "Range set".to_string(),
            "Go" => {
                let mark = line.rsplit(',').next().unwrap_or_default();
                append_samples(&raw_log, mark);
                "Starting untimed measurement".to_string()
            }
            "Stop" => "Stopping untimed measurement".to_string(),
            _ => format!("Error: unknown command {}", line),
        };
        if writer
            .write_all(format!("{}\r\n", reply).as_bytes())
            .await
            .is_err()
        {
            return;
        }
    }
}

fn append_samples(raw_log: &Path, mark: &str) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(raw_log)
        .unwrap();
    for (volts, amps) in SAMPLES {
        writeln!(
            file,
            "Time,10-05-2024 12:00:01.000,Watts,{},Volts,{},Amps,{},PF,1.0,Mark,{}",
            volts * amps,
            volts,
            amps,
            mark
        )
        .unwrap();
    }
}

/// Connects to an already running daemon instead of spawning one.
pub struct FakePtdLauncher {
    addr: SocketAddr,
    settings: AnalyzerSettings,
}

#[async_trait]
impl AnalyzerLauncher for FakePtdLauncher {
    async fn launch(&self) -> Result<Analyzer, InstrumentError> {
        let mut adapter = TcpLineAdapter::new(self.addr).with_timeout(Duration::from_secs(2));
        adapter.connect().await?;
        Analyzer::connect(Box::new(adapter), None, self.settings.clone()).await
    }
}

/// A director on a random port, backed by a [`FakePtd`]
pub struct Director {
    pub addr: SocketAddr,
    pub out_dir: PathBuf,
    pub instrument: InstrumentHandle,
    pub ptd: FakePtd,
    pub task: JoinHandle<AppResult<()>>,
    pub dir: TempDir,
}

pub async fn start_director() -> Director {
    let dir = TempDir::new().unwrap();
    let ptd = FakePtd::start(dir.path().join("ptd_logfile.log")).await;
    let launcher = FakePtdLauncher {
        addr: ptd.addr,
        settings: AnalyzerSettings {
            settle_delay: Duration::ZERO,
            ..Default::default()
        },
    };
    let instrument = InstrumentHandle::new(Arc::new(launcher));
    let out_dir = dir.path().join("out");
    let ctx = SessionContext {
        out_dir: out_dir.clone(),
        raw_log: ptd.raw_log.clone(),
        ranging_mode: RangingMode::Auto,
        device_type: 49,
        correction_factor: 1.1,
        calibration: CalibrationStore::empty(),
        keep_daemon: false,
    };

    let server = Server::bind_with("127.0.0.1:0".parse().unwrap(), ctx, instrument.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let task = tokio::spawn(server.run());

    Director {
        addr,
        out_dir,
        instrument,
        ptd,
        task,
        dir,
    }
}

/// Raw line client for driving the command protocol by hand
pub struct LineClient {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl LineClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await
            .unwrap();
    }

    /// Write a length-prefixed payload the way the transfer codec frames it.
    pub async fn send_blob(&mut self, payload: &[u8]) {
        self.writer
            .write_all(&(payload.len() as i64).to_le_bytes())
            .await
            .unwrap();
        self.writer.write_all(payload).await.unwrap();
    }

    pub async fn recv(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    pub async fn cmd(&mut self, line: &str) -> String {
        self.send(line).await;
        self.recv().await
    }

    /// Open a session and return its id.
    pub async fn new_session(&mut self, label: &str) -> String {
        let reply = self.cmd(&format!("new,{}", label)).await;
        reply
            .strip_prefix("OK ")
            .unwrap_or_else(|| panic!("new failed: {}", reply))
            .to_string()
    }
}

/// Poll `check` every 20 ms until it holds or `within` passes.
pub async fn eventually<F: FnMut() -> bool>(within: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
