//! One-shot command client.
//!
//! Sends a single command line and reads the reply. A reply announcing an
//! `int16 <n>` payload is followed by `n` little-endian values, which are
//! read as well so the connection is left at a line boundary.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("command must be a single ASCII line")]
    InvalidCommand,
    #[error("connection closed before a reply")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A reply: the status line and any binary payload after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub line: String,
    pub payload: Option<Vec<i16>>,
}

/// Connect to `addr`, send `command` and read its reply.
pub async fn request(addr: impl ToSocketAddrs, command: &str) -> Result<Reply, ClientError> {
    let stream = TcpStream::connect(addr).await?;
    debug!(peer = ?stream.peer_addr().ok(), "Connected");
    exchange(stream, command).await
}

/// Send one command over `stream` and read the reply.
pub async fn exchange<S>(stream: S, command: &str) -> Result<Reply, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !command.is_ascii() || command.contains(['\r', '\n']) {
        return Err(ClientError::InvalidCommand);
    }

    let mut stream = BufReader::new(stream);
    let request = format!("{command}\n");
    stream.get_mut().write_all(request.as_bytes()).await?;
    stream.get_mut().flush().await?;

    let mut line = String::new();
    if stream.read_line(&mut line).await? == 0 {
        return Err(ClientError::Closed);
    }
    let line = line.trim_end().to_string();

    let payload = match payload_len(&line) {
        Some(n) => {
            let mut raw = vec![0u8; n * 2];
            stream.read_exact(&mut raw).await?;
            Some(
                raw.chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect(),
            )
        }
        None => None,
    };

    Ok(Reply { line, payload })
}

/// Element count of an `OK ... int16 <n>` reply.
fn payload_len(line: &str) -> Option<usize> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.as_slice() {
        ["OK", .., "int16", n] => n.parse().ok(),
        _ => None,
    }
}
