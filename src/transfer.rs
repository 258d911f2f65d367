//! Length-prefixed file transfer over the command connection.
//!
//! A transfer is an 8-byte signed little-endian length followed by exactly
//! that many payload bytes. There is no resume: a negative length or a
//! stream ending early is a fatal error and the connection is dropped,
//! because the two ends no longer agree where the next command starts.
//!
//! Received payloads are written to `<dest>.part` and renamed onto `<dest>`
//! once complete, so `<dest>` only ever holds a whole payload.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Bytes written per call when sending
pub const SEND_CHUNK: usize = 4096;

/// Largest read per call when receiving
pub const RECV_CHUNK: usize = 64 * 1024;

/// Transfer codec errors
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Negative payload length {0}")]
    NegativeLength(i64),

    #[error("Stream ended after {received} of {expected} payload bytes")]
    ShortRead { expected: u64, received: u64 },

    #[error("Source {path} changed size during transfer")]
    SourceChanged { path: PathBuf },

    #[error("Transfer I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// Send the contents of `path`. Returns the payload length.
pub async fn send_file<W>(writer: &mut W, path: &Path) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let mut file = File::open(path).await?;
    let len = file.metadata().await?.len();
    writer.write_all(&header(len)).await?;

    let mut buf = vec![0u8; SEND_CHUNK];
    let mut sent = 0u64;
    while sent < len {
        let want = SEND_CHUNK.min((len - sent) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::SourceChanged {
                path: path.to_path_buf(),
            });
        }
        writer.write_all(&buf[..n]).await?;
        sent += n as u64;
    }
    writer.flush().await?;
    debug!(path = %path.display(), bytes = len, "File sent");
    Ok(len)
}

/// Receive one payload into `dest`. Returns the payload length.
pub async fn recv_file<R>(reader: &mut R, dest: &Path) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let expected = read_header(reader).await?;
    let part = part_path(dest);

    let result = write_payload(reader, &part, expected).await;
    match result {
        Ok(()) => {
            tokio::fs::rename(&part, dest).await?;
            debug!(path = %dest.display(), bytes = expected, "File received");
            Ok(expected)
        }
        Err(e) => {
            let _ = tokio::fs::remove_file(&part).await;
            Err(e)
        }
    }
}

/// Read and discard one payload so the stream stays framed.
pub async fn drain<R>(reader: &mut R) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let expected = read_header(reader).await?;
    let received = io::copy(&mut (&mut *reader).take(expected), &mut io::sink()).await?;
    if received < expected {
        return Err(TransferError::ShortRead { expected, received });
    }
    debug!(bytes = expected, "Payload discarded");
    Ok(expected)
}

fn header(len: u64) -> [u8; 8] {
    (len as i64).to_le_bytes()
}

async fn read_header<R>(reader: &mut R) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; 8];
    reader.read_exact(&mut raw).await.map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransferError::ShortRead {
                expected: 8,
                received: 0,
            }
        } else {
            TransferError::Io(e)
        }
    })?;
    let len = i64::from_le_bytes(raw);
    if len < 0 {
        return Err(TransferError::NegativeLength(len));
    }
    Ok(len as u64)
}

async fn write_payload<R>(reader: &mut R, part: &Path, expected: u64) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(part).await?;
    let mut buf = vec![0u8; RECV_CHUNK];
    let mut received = 0u64;
    while received < expected {
        let want = RECV_CHUNK.min((expected - received) as usize);
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::ShortRead { expected, received });
        }
        file.write_all(&buf[..n]).await?;
        received += n as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}
