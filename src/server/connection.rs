//! One client connection: read a command, act, answer, repeat.

use super::Shared;
use crate::error::{AppResult, DirectorError};
use crate::protocol::{
    self, ProtocolError, Request, Response, SessionCommand, PROTOCOL_VERSION,
};
use crate::session::{Phase, Session};
use crate::transfer;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

/// Serve `stream` until the peer disconnects or the stream breaks.
pub(crate) async fn serve(stream: TcpStream, peer: SocketAddr, shared: Arc<Shared>) {
    let span = info_span!("connection", %peer);
    async move {
        info!("Client connected");
        let (reader, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(reader),
            writer,
            session: None,
            shared: shared.clone(),
        };
        conn.run().await;

        if let Some(session) = conn.session.take() {
            session.abort().await;
        }
        info!("Client disconnected");
        shared.connection_closed();
    }
    .instrument(span)
    .await
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    session: Option<Session>,
    shared: Arc<Shared>,
}

impl Connection {
    async fn run(&mut self) {
        loop {
            let line = match protocol::read_line(&mut self.reader).await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "Connection lost");
                    return;
                }
            };
            debug!(command = %line, "Received");

            let result = match Request::parse(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => Err(e.into()),
            };

            let response = match result {
                Ok(Some(response)) => response,
                // the handler already answered
                Ok(None) => continue,
                Err(e) if e.is_connection_fatal() => {
                    warn!(
                        session = self.session_id(),
                        command = %line,
                        error = %e,
                        "Closing connection"
                    );
                    return;
                }
                Err(e) => {
                    warn!(session = self.session_id(), command = %line, error = %e, "Command failed");
                    Response::err(e)
                }
            };

            if let Err(e) = protocol::write_line(&mut self.writer, &response.to_string()).await {
                warn!(error = %e, "Failed to write response");
                return;
            }
        }
    }

    fn session_id(&self) -> &str {
        self.session.as_ref().map(Session::id).unwrap_or("-")
    }

    /// Handle one request. `Ok(None)` means the response was already sent.
    async fn dispatch(&mut self, request: Request) -> AppResult<Option<Response>> {
        match request {
            Request::Hello => Ok(Some(Response::ok_with(PROTOCOL_VERSION))),
            Request::Time => {
                let now = Utc::now();
                let secs = now.timestamp() as f64 + f64::from(now.timestamp_subsec_micros()) / 1e6;
                Ok(Some(Response::ok_with(format!("{:.6}", secs))))
            }
            Request::New { label, client_uuid } => {
                if let Some(session) = &self.session {
                    return Err(ProtocolError::SessionActive(session.id().to_string()).into());
                }
                let session = Session::new(
                    &label,
                    client_uuid,
                    self.shared.ctx.clone(),
                    &self.shared.instrument,
                )?;
                let id = session.id().to_string();
                self.session = Some(session);
                Ok(Some(Response::ok_with(id)))
            }
            Request::Session { id, command } => self.session_command(&id, command).await,
            Request::Download { id, file } => self.download(&id, &file).await,
            Request::Cleanup { id } => {
                let finished = self
                    .shared
                    .finished(&id)
                    .ok_or(ProtocolError::UnknownSession(id))?;
                finished.remove()?;
                self.shared.set_last_finished(None);
                Ok(Some(Response::ok()))
            }
            Request::Stop => {
                info!("Server stop requested");
                self.shared.request_stop();
                Ok(Some(Response::ok()))
            }
        }
    }

    async fn session_command(
        &mut self,
        id: &str,
        command: SessionCommand,
    ) -> AppResult<Option<Response>> {
        let rejection = match self.session.as_ref() {
            None => Some(ProtocolError::NoActiveSession),
            Some(session) if session.id() != id => {
                Some(ProtocolError::UnknownSession(id.to_string()))
            }
            Some(_) => None,
        };
        if let Some(rejection) = rejection {
            if matches!(command, SessionCommand::Upload(_)) {
                transfer::drain(&mut self.reader).await?;
            }
            return Err(rejection.into());
        }
        if let SessionCommand::Upload(phase) = command {
            return self.upload(phase).await;
        }

        let session = self
            .session
            .as_mut()
            .ok_or(ProtocolError::NoActiveSession)?;
        match command {
            SessionCommand::Start { phase, range } => session.start(phase, range).await?,
            SessionCommand::Stop(phase) => session.stop(phase).await?,
            SessionCommand::Upload(_) => {}
            SessionCommand::Done => {
                let finished = session.done().await?;
                self.session = None;
                self.shared.set_last_finished(Some(finished));
            }
        }
        Ok(Some(Response::ok()))
    }

    /// Receive an upload; in a state that forbids it, drain and reject.
    async fn upload(&mut self, phase: Phase) -> AppResult<Option<Response>> {
        let session = self
            .session
            .as_mut()
            .ok_or(ProtocolError::NoActiveSession)?;
        let dest = match session.upload_target(phase) {
            Ok(dest) => dest,
            Err(e) => {
                transfer::drain(&mut self.reader).await?;
                return Err(e);
            }
        };

        let bytes = transfer::recv_file(&mut self.reader, &dest).await?;
        info!(session = session.id(), %phase, bytes, "Upload received");
        session.store_upload(phase, &dest).await?;
        Ok(Some(Response::ok()))
    }

    async fn download(&mut self, id: &str, file: &str) -> AppResult<Option<Response>> {
        let finished = self
            .shared
            .finished(id)
            .ok_or_else(|| ProtocolError::UnknownSession(id.to_string()))?;
        let path = finished
            .resolve(file)
            .filter(|path| path.is_file())
            .ok_or_else(|| ProtocolError::NotDownloadable(file.to_string()))?;

        protocol::write_line(&mut self.writer, &Response::ok().to_string()).await?;
        let bytes = transfer::send_file(&mut self.writer, &path)
            .await
            .map_err(DirectorError::from)?;
        info!(session = id, file, bytes, "Download sent");
        Ok(None)
    }
}
