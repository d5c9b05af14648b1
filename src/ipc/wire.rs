//! Framing helpers for the IPC socket.
//!
//! The init exchange and Subscribe-mode traffic are line-delimited JSON;
//! every other mode speaks 4-byte little-endian length-prefixed JSON
//! envelopes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::{Error, Result};

/// Upper bound on a single IPC message, to keep a bad client from ballooning
/// the daemon.
const MAX_MESSAGE: u32 = 4 * 1024 * 1024;

pub async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut raw = serde_json::to_vec(message)?;
    raw.push(b'\n');
    writer.write_all(&raw).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one line of JSON; `None` on a cleanly closed peer.
pub async fn read_line<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(Error::Ipc("empty message".to_string()));
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}

pub async fn write_envelope<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let raw = serde_json::to_vec(message)?;
    writer.write_all(&(raw.len() as u32).to_le_bytes()).await?;
    writer.write_all(&raw).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed envelope; `None` on a cleanly closed peer.
pub async fn read_envelope<R, T>(reader: &mut BufReader<R>) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut length = [0u8; 4];
    match tokio::io::AsyncReadExt::read_exact(reader, &mut length).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = u32::from_le_bytes(length);
    if length > MAX_MESSAGE {
        return Err(Error::Ipc(format!("oversized message ({length} bytes)")));
    }
    let mut raw = vec![0u8; length as usize];
    tokio::io::AsyncReadExt::read_exact(reader, &mut raw).await?;
    Ok(Some(serde_json::from_slice(&raw)?))
}
