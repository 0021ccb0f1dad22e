//! Framing and handshake for the kernel stdio connection.
//!
//! A kernel child process talks to the session over its stdin/stdout using
//! length-prefixed frames:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [JSON payload bytes]
//! ```
//!
//! Before any frame is exchanged the child prints a single literal
//! [`READY_TOKEN`] line on stdout. Anything printed before the token (an
//! interpreter banner, a warning from site-packages) is logged and skipped.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::commands::Command;
use crate::kernel::KernelLaunchInfo;
use crate::notifications::Notification;

/// Maximum frame size: 100 MiB. Large widget buffers ride on these frames.
const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

/// Line a kernel child prints once it is ready for framed traffic.
pub const READY_TOKEN: &str = "nbsession-kernel-ready";

/// Frames sent from the session to the kernel child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelInbound {
    /// First frame after the handshake.
    Configure { launch: KernelLaunchInfo },
    /// A control-queue command.
    Control { command: Command },
    /// A UI-element or widget-model update. Sent once; the receiver puts it
    /// on the batching queue and then the control queue, like a local put.
    UiUpdate { command: Command },
    /// A code-completion request.
    Completion { command: Command },
    /// Answer to a pending stdin prompt.
    Input { text: String },
    /// Interrupt request for platforms without signal delivery.
    Interrupt,
}

/// Frames sent from the kernel child to the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KernelOutbound {
    Notification { notification: Notification },
}

/// Send a length-prefixed frame.
pub async fn send_frame<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> std::io::Result<()> {
    let len = (data.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Receive a length-prefixed frame. Returns `None` on clean disconnect (EOF).
pub async fn recv_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

/// Send a value as a JSON-encoded length-prefixed frame.
pub async fn send_json_frame<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    value: &T,
) -> anyhow::Result<()> {
    let data = serde_json::to_vec(value)?;
    send_frame(writer, &data).await?;
    Ok(())
}

/// Receive and deserialize a JSON-encoded length-prefixed frame.
/// Returns `None` on clean disconnect (EOF).
///
/// A frame that arrives intact but fails to decode is an `Err`; the
/// stream stays aligned and the caller may keep reading.
pub async fn recv_json_frame<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> anyhow::Result<Option<T>> {
    match recv_frame(reader).await? {
        Some(data) => {
            let value = serde_json::from_slice(&data)?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Print the ready token line.
pub async fn write_ready_token<W: AsyncWrite + Unpin>(writer: &mut W) -> std::io::Result<()> {
    writer.write_all(READY_TOKEN.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Read lines until the ready token appears.
///
/// Returns the lines skipped before the token. Fails if the stream ends
/// first.
pub async fn wait_for_ready_token<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Vec<String>> {
    let mut skipped = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "kernel exited before printing the ready token",
            ));
        }
        let trimmed = line.trim_end();
        if trimmed == READY_TOKEN {
            return Ok(skipped);
        }
        log::debug!("[kernel-handshake] Skipping pre-handshake output: {}", trimmed);
        skipped.push(trimmed.to_string());
    }
}
