//! Newline-delimited JSON framing.
//!
//! One [`Message`] per line: a JSON object followed by a single `\n`.
//! The line boundary is the sole framing mechanism -- no length prefix,
//! no compression. This is a deliberate simplicity/fragility trade-off:
//! JSON string escaping guarantees the serialized object itself contains
//! no raw newline, and in exchange the stream stays debuggable with
//! netcat-style tools. Do not "fix" this with a different framing.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::WireError;
use crate::message::Message;

/// Encode a message into a single wire frame (JSON + trailing `\n`).
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let mut frame = serde_json::to_vec(msg).map_err(WireError::MalformedFrame)?;
    frame.push(b'\n');
    Ok(frame)
}

/// Read the next frame off the stream.
///
/// Returns `Ok(None)` on end-of-stream; a frame truncated by the peer
/// closing mid-line is also reported as end-of-stream rather than as a
/// protocol error. Invalid JSON in a complete line is a
/// [`WireError::MalformedFrame`]. Blank lines are skipped.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, WireError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') {
            // Partial line at EOF: the peer went away mid-frame.
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        return serde_json::from_str(trimmed)
            .map(Some)
            .map_err(WireError::MalformedFrame);
    }
}

/// Encode and write one frame, flushing so the peer sees it promptly.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
