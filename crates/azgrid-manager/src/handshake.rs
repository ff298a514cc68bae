//! Worker handshake parsing.
//!
//! Wire format, master ← worker: exactly [`HDR_COOKIE_LEN`] bytes of
//! ASCII cookie right-padded with spaces, then one newline-terminated
//! line of base64 whose payload is the worker's JSON self-description.

use azgrid_core::{WorkerGreeting, HDR_COOKIE_LEN};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::error::{ManagerError, ManagerResult};

/// Greeting lines longer than this are junk, not a handshake.
const MAX_GREETING_LINE: usize = 64 * 1024;

/// Read and validate a worker handshake. The stream is left positioned
/// directly after the greeting line, ready to hand to the runtime.
pub async fn read_handshake(
    stream: &mut TcpStream,
    cookie: &str,
) -> ManagerResult<WorkerGreeting> {
    let mut presented = [0u8; HDR_COOKIE_LEN];
    stream.read_exact(&mut presented).await?;
    if presented != padded_cookie(cookie) {
        return Err(ManagerError::InvalidCookie);
    }

    let line = read_line(stream).await?;
    let decoded = STANDARD
        .decode(&line)
        .map_err(|e| ManagerError::Handshake(format!("bad base64: {e}")))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| ManagerError::Handshake(format!("bad greeting json: {e}")))
}

/// The cookie as it appears on the wire: right-padded with spaces and
/// truncated to the header length.
pub fn padded_cookie(cookie: &str) -> [u8; HDR_COOKIE_LEN] {
    let mut padded = [b' '; HDR_COOKIE_LEN];
    let bytes = cookie.as_bytes();
    let n = bytes.len().min(HDR_COOKIE_LEN);
    padded[..n].copy_from_slice(&bytes[..n]);
    padded
}

/// Read up to a `\n`, one byte at a time so nothing past the greeting
/// is consumed from the stream.
async fn read_line(stream: &mut TcpStream) -> ManagerResult<Vec<u8>> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        match byte[0] {
            b'\n' => return Ok(line),
            b'\r' => {}
            b => {
                line.push(b);
                if line.len() > MAX_GREETING_LINE {
                    return Err(ManagerError::Handshake("greeting line too long".into()));
                }
            }
        }
    }
}
