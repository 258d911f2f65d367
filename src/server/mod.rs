//! Director server
//!
//! Listens for client connections and runs each one in its own task. A
//! connection owns at most one [`Session`](crate::session::Session); the
//! analyzer is shared through an [`InstrumentHandle`], so while one session
//! is active any other connection's `new` is refused.

mod connection;

use crate::calibration::CalibrationStore;
use crate::config::ServerSettings;
use crate::error::AppResult;
use crate::instrument::{DaemonLauncher, InstrumentHandle};
use crate::liveness::KeepaliveConfig;
use crate::session::{FinishedSession, SessionContext};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// How long shutdown waits for a session to let go of the instrument
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// State shared by all connection tasks
pub(crate) struct Shared {
    pub(crate) instrument: InstrumentHandle,
    pub(crate) ctx: Arc<SessionContext>,
    last_finished: Mutex<Option<FinishedSession>>,
    stop_requested: AtomicBool,
    stopped: Notify,
}

impl Shared {
    pub(crate) fn set_last_finished(&self, finished: Option<FinishedSession>) {
        if let Ok(mut last) = self.last_finished.lock() {
            *last = finished;
        }
    }

    /// The last finished session, if its id is `id`
    pub(crate) fn finished(&self, id: &str) -> Option<FinishedSession> {
        self.last_finished
            .lock()
            .ok()
            .and_then(|last| last.as_ref().filter(|f| f.id == id).cloned())
    }

    pub(crate) fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub(crate) fn connection_closed(&self) {
        if self.stop_requested.load(Ordering::SeqCst) {
            self.stopped.notify_one();
        }
    }
}

pub struct Server {
    listener: TcpListener,
    keepalive: KeepaliveConfig,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listener and prepare the daemon launcher from settings.
    pub async fn bind(settings: &ServerSettings) -> AppResult<Self> {
        let calibration = match &settings.server.calibration_file {
            Some(path) => CalibrationStore::load(path)?,
            None => CalibrationStore::empty(),
        };
        let ctx = SessionContext::from_settings(settings, calibration);
        let launcher = DaemonLauncher::new(settings.ptd.clone(), &ctx.out_dir);
        let instrument = InstrumentHandle::new(Arc::new(launcher));
        let server = Self::bind_with(settings.server.listen, ctx, instrument).await?;
        Ok(server.with_keepalive((&settings.server.keepalive).into()))
    }

    /// Bind with an explicit session context and instrument.
    pub async fn bind_with(
        addr: SocketAddr,
        ctx: SessionContext,
        instrument: InstrumentHandle,
    ) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Director listening");
        Ok(Self {
            listener,
            keepalive: KeepaliveConfig::default(),
            shared: Arc::new(Shared {
                instrument,
                ctx: Arc::new(ctx),
                last_finished: Mutex::new(None),
                stop_requested: AtomicBool::new(false),
                stopped: Notify::new(),
            }),
        })
    }

    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a client sent `stop` and disconnected.
    pub async fn run(self) -> AppResult<()> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`Server::run`], but also leave when `shutdown` completes.
    ///
    /// Either way a daemon kept between sessions is restored and stopped
    /// before returning.
    pub async fn run_until<F>(self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            continue;
                        }
                    };
                    let shared = self.shared.clone();
                    tokio::spawn(connection::serve(stream, peer, shared));
                }
                _ = self.shared.stopped.notified() => {
                    info!("Stop requested, leaving accept loop");
                    break;
                }
                _ = &mut shutdown => {
                    info!("Shutdown signalled, leaving accept loop");
                    break;
                }
            }
        }

        let instrument = self.shared.instrument.clone();
        if tokio::time::timeout(SHUTDOWN_GRACE, instrument.shutdown())
            .await
            .is_err()
        {
            warn!(grace = ?SHUTDOWN_GRACE, "Instrument still in use, leaving it running");
        }
        Ok(())
    }

    /// Accept one connection and enable keepalive on it.
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().await?;
        if let Err(e) = self.keepalive.apply(&stream) {
            warn!(%peer, error = %e, "Could not enable keepalive");
        }
        Ok((stream, peer))
    }
}
