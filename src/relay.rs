//! WebSocket side of the worker. The tunnel data plane is not implemented:
//! accepted sockets echo whatever they receive.

use std::io::{Error, ErrorKind, Result};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::websocket::WebSocketStream;

const ECHO_BUFFER: usize = 16 * 1024;

/// Decodes early data carried in `Sec-WebSocket-Protocol`. Both the standard
/// and URL-safe alphabets are accepted, padding optional.
pub fn parse_early_data(header: Option<String>) -> Result<Option<Vec<u8>>> {
    let Some(data) = header.filter(|d| !d.is_empty()) else {
        return Ok(None);
    };
    let normalized = data.replace('+', "-").replace('/', "_").replace('=', "");
    URL_SAFE_NO_PAD
        .decode(normalized)
        .map(Some)
        .map_err(|e| Error::new(ErrorKind::InvalidData, e))
}

/// Writes every chunk read from `socket` straight back until the peer closes.
pub async fn run_echo(mut socket: WebSocketStream<'_>) -> Result<u64> {
    let mut buf = vec![0u8; ECHO_BUFFER];
    let mut total = 0u64;
    loop {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        socket.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    socket.shutdown().await?;
    Ok(total)
}
