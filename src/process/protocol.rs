//! Wire protocol between the dispatcher and a worker process.
//!
//! One JSON object per line over the child's stdin (parent → child) and
//! stdout (child → parent). Every message carries the correlation id of the
//! request it belongs to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Upper bound for a single encoded line (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// A unit of work sent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPayload {
    /// Operation name understood by the worker.
    pub op: String,
    /// Operation arguments.
    #[serde(default)]
    pub args: Value,
}

impl WorkPayload {
    pub fn new(op: impl Into<String>, args: Value) -> Self {
        Self {
            op: op.into(),
            args,
        }
    }
}

/// A successful result, tagged with the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub correlation_id: Uuid,
    pub result: Value,
}

/// Parent → child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    Work {
        correlation_id: Uuid,
        payload: WorkPayload,
    },
}

/// Child → parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChildMessage {
    Result { correlation_id: Uuid, result: Value },
    Error { correlation_id: Uuid, message: String },
}

impl ChildMessage {
    pub fn correlation_id(&self) -> Uuid {
        match self {
            Self::Result { correlation_id, .. } | Self::Error { correlation_id, .. } => {
                *correlation_id
            }
        }
    }
}

/// Encode a message as a single newline-terminated line.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(msg)?;
    if line.len() >= MAX_LINE_BYTES {
        return Err(ProtocolError::TooLarge {
            max: MAX_LINE_BYTES,
        });
    }
    line.push('\n');
    Ok(line)
}

/// Decode one line (trailing whitespace ignored).
pub fn decode_line<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T, ProtocolError> {
    if line.len() > MAX_LINE_BYTES {
        return Err(ProtocolError::TooLarge {
            max: MAX_LINE_BYTES,
        });
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Reads newline-terminated lines, never buffering more than `max` bytes
/// of a single line.
///
/// An over-long line is an error and leaves the reader mid-line, so callers
/// treat it as fatal for the stream.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    max: usize,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    /// A reader capped at [`MAX_LINE_BYTES`].
    pub fn new(inner: R) -> Self {
        Self::with_max(inner, MAX_LINE_BYTES)
    }

    pub fn with_max(inner: R, max: usize) -> Self {
        Self { inner, max }
    }

    /// Next line without its terminator. `None` at end of input.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProtocolError> {
        // One extra byte leaves room for the newline of a maximal line.
        let limit = self.max as u64 + 1;
        let mut buf = Vec::new();
        let read = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;
        if read == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
        } else if read as u64 == limit {
            return Err(ProtocolError::TooLarge { max: self.max });
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }

        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e).into())
    }
}
