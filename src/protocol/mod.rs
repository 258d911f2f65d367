//! Client/server command protocol
//!
//! Newline-delimited ASCII. A request is `<verb>[,<field>]*`, a response is
//! `OK[ <payload>]` or `ERR <message>`. The server writes CRLF and accepts
//! either CRLF or LF.
//!
//! ```text
//! hello                                   -> OK ptd-director/<version>
//! new,<label>[,<client-uuid>]             -> OK <session-id>
//! time                                    -> OK <unix-seconds>
//! session,<id>,start,ranging
//! session,<id>,stop,ranging
//! session,<id>,upload,ranging             (followed by a transfer)
//! session,<id>,start,testing[,auto|,<volts>,<amps>]
//! session,<id>,stop,testing
//! session,<id>,upload,testing             (followed by a transfer)
//! session,<id>,done
//! download,<id>,<file>                    -> OK, then a transfer
//! cleanup,<id>
//! stop
//! ```
//!
//! Requests are parsed once into [`Request`] and dispatched by matching on it.

use crate::session::Phase;
use std::fmt;
use thiserror::Error;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reported by `hello`; the client refuses other major protocols.
pub const PROTOCOL_VERSION: &str = concat!("ptd-director/", env!("CARGO_PKG_VERSION"));

/// Prefix shared by every compatible protocol version
pub const PROTOCOL_NAME: &str = "ptd-director/";

/// Longest accepted command line
pub const MAX_LINE_LEN: u64 = 4096;

/// Malformed or out-of-order commands. Answered with `ERR`; the connection
/// stays usable.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command '{0}'")]
    UnknownVerb(String),

    #[error("'{verb}' is missing the {field} field")]
    MissingField { verb: String, field: &'static str },

    #[error("'{verb}' has unexpected trailing fields")]
    TrailingFields { verb: String },

    #[error("Invalid {field} '{value}'")]
    Malformed { field: &'static str, value: String },

    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Unknown session '{0}'")]
    UnknownSession(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Session {0} is still active")]
    SessionActive(String),

    #[error("'{command}' not allowed while {state}")]
    OutOfOrder { command: String, state: String },

    #[error("Invalid label '{0}', use letters, digits, '-' and '_'")]
    InvalidLabel(String),

    #[error("No calibration from ranging, give a testing range explicitly")]
    NoCalibration,

    #[error("File '{0}' is not available for download")]
    NotDownloadable(String),

    #[error("Unexpected reply '{0}'")]
    UnexpectedReply(String),
}

/// Range requested with `start,testing`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RequestedRange {
    Auto,
    Explicit { volts: f64, amps: f64 },
}

/// Commands addressed to one session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Start {
        phase: Phase,
        range: Option<RequestedRange>,
    },
    Stop(Phase),
    Upload(Phase),
    Done,
}

/// One parsed request line
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Hello,
    New {
        label: String,
        client_uuid: Option<String>,
    },
    Time,
    Session {
        id: String,
        command: SessionCommand,
    },
    Download {
        id: String,
        file: String,
    },
    Cleanup {
        id: String,
    },
    Stop,
}

struct Fields<'a> {
    verb: &'a str,
    rest: std::str::Split<'a, char>,
}

impl<'a> Fields<'a> {
    fn required(&mut self, field: &'static str) -> Result<&'a str, ProtocolError> {
        self.rest.next().ok_or_else(|| ProtocolError::MissingField {
            verb: self.verb.to_string(),
            field,
        })
    }

    fn optional(&mut self) -> Option<&'a str> {
        self.rest.next()
    }

    fn finish(mut self) -> Result<(), ProtocolError> {
        match self.rest.next() {
            None => Ok(()),
            Some(_) => Err(ProtocolError::TrailingFields {
                verb: self.verb.to_string(),
            }),
        }
    }
}

impl Request {
    /// Parse one line, without its terminator.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Err(ProtocolError::Empty);
        }
        let mut parts = line.split(',');
        let verb = parts.next().unwrap_or_default();
        let mut fields = Fields { verb, rest: parts };

        let request = match verb {
            "hello" => Request::Hello,
            "time" => Request::Time,
            "stop" => Request::Stop,
            "new" => {
                let label = fields.required("label")?.to_string();
                let client_uuid = fields.optional().map(str::to_string);
                Request::New { label, client_uuid }
            }
            "session" => {
                let id = fields.required("session id")?.to_string();
                let command = parse_session_command(&mut fields)?;
                Request::Session { id, command }
            }
            "download" => Request::Download {
                id: fields.required("session id")?.to_string(),
                file: fields.required("file name")?.to_string(),
            },
            "cleanup" => Request::Cleanup {
                id: fields.required("session id")?.to_string(),
            },
            other => return Err(ProtocolError::UnknownVerb(other.to_string())),
        };
        fields.finish()?;
        Ok(request)
    }
}

fn parse_session_command(fields: &mut Fields<'_>) -> Result<SessionCommand, ProtocolError> {
    let action = fields.required("action")?;
    let command = match action {
        "start" => {
            let phase: Phase = fields.required("phase")?.parse()?;
            let range = match (phase, fields.optional()) {
                (_, None) => None,
                (Phase::Testing, Some("auto")) => Some(RequestedRange::Auto),
                (Phase::Testing, Some(volts)) => {
                    let amps = fields.required("amps")?;
                    Some(RequestedRange::Explicit {
                        volts: parse_positive("volts", volts)?,
                        amps: parse_positive("amps", amps)?,
                    })
                }
                (Phase::Ranging, Some(_)) => {
                    return Err(ProtocolError::TrailingFields {
                        verb: "start,ranging".to_string(),
                    })
                }
            };
            SessionCommand::Start { phase, range }
        }
        "stop" => SessionCommand::Stop(fields.required("phase")?.parse()?),
        "upload" => SessionCommand::Upload(fields.required("phase")?.parse()?),
        "done" => SessionCommand::Done,
        other => return Err(ProtocolError::UnknownVerb(format!("session,{}", other))),
    };
    Ok(command)
}

fn parse_positive(field: &'static str, value: &str) -> Result<f64, ProtocolError> {
    match value.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Ok(v),
        _ => Err(ProtocolError::Malformed {
            field,
            value: value.to_string(),
        }),
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Hello => f.write_str("hello"),
            Request::Time => f.write_str("time"),
            Request::Stop => f.write_str("stop"),
            Request::New { label, client_uuid } => {
                write!(f, "new,{}", label)?;
                if let Some(uuid) = client_uuid {
                    write!(f, ",{}", uuid)?;
                }
                Ok(())
            }
            Request::Session { id, command } => {
                write!(f, "session,{},", id)?;
                match command {
                    SessionCommand::Start { phase, range } => {
                        write!(f, "start,{}", phase)?;
                        match range {
                            None => Ok(()),
                            Some(RequestedRange::Auto) => f.write_str(",auto"),
                            Some(RequestedRange::Explicit { volts, amps }) => {
                                write!(f, ",{},{}", volts, amps)
                            }
                        }
                    }
                    SessionCommand::Stop(phase) => write!(f, "stop,{}", phase),
                    SessionCommand::Upload(phase) => write!(f, "upload,{}", phase),
                    SessionCommand::Done => f.write_str("done"),
                }
            }
            Request::Download { id, file } => write!(f, "download,{},{}", id, file),
            Request::Cleanup { id } => write!(f, "cleanup,{}", id),
        }
    }
}

/// One response line
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok(Option<String>),
    Err(String),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(None)
    }

    pub fn ok_with(payload: impl Into<String>) -> Self {
        Response::Ok(Some(payload.into()))
    }

    /// `ERR` response; line breaks in `message` are flattened.
    pub fn err(message: impl fmt::Display) -> Self {
        let message = message.to_string().replace(['\r', '\n'], " ");
        Response::Err(message)
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line == "OK" {
            return Ok(Response::Ok(None));
        }
        if let Some(payload) = line.strip_prefix("OK ") {
            return Ok(Response::Ok(Some(payload.to_string())));
        }
        if line == "ERR" {
            return Ok(Response::Err(String::new()));
        }
        if let Some(message) = line.strip_prefix("ERR ") {
            return Ok(Response::Err(message.to_string()));
        }
        Err(ProtocolError::UnexpectedReply(line.to_string()))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok(_))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(None) => f.write_str("OK"),
            Response::Ok(Some(payload)) => write!(f, "OK {}", payload),
            Response::Err(message) => write!(f, "ERR {}", message),
        }
    }
}

/// Read one line, stripped of CR/LF. `None` on a clean end of stream.
pub async fn read_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN)
        .read_line(&mut line)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with('\n') {
        if n as u64 >= MAX_LINE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("command line longer than {} bytes", MAX_LINE_LEN),
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed mid-line",
        ));
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

/// Write one CRLF-terminated line.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}
