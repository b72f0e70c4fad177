//! Worker-side message loop.
//!
//! Reads work envelopes from stdin, runs them through a [`WorkHandler`] one
//! at a time, and writes result envelopes to stdout in the same order.
//! Returns when stdin closes, or with an error on a line longer than
//! [`MAX_LINE_BYTES`](crate::process::protocol::MAX_LINE_BYTES).

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::ProtocolError;
use crate::process::protocol::{
    ChildMessage, LineReader, ParentMessage, WorkPayload, decode_line, encode_line,
};

/// Computes results for incoming work.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Handle one payload. `Err` is reported to the parent as a failed request.
    async fn handle(&self, payload: WorkPayload) -> Result<Value, String>;
}

/// Serve work over the process's stdin/stdout until stdin closes.
pub async fn serve<H: WorkHandler>(handler: &H) -> std::io::Result<()> {
    serve_io(handler, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Serve work over arbitrary streams.
pub async fn serve_io<H, R, W>(handler: &H, input: R, mut output: W) -> std::io::Result<()>
where
    H: WorkHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = LineReader::new(BufReader::new(input));
    while let Some(line) = lines.next_line().await.map_err(into_io)? {
        if line.trim().is_empty() {
            continue;
        }

        let ParentMessage::Work {
            correlation_id,
            payload,
        } = match decode_line(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Skipping malformed work message");
                continue;
            }
        };

        debug!(correlation_id = %correlation_id, op = %payload.op, "Handling work");
        let reply = match handler.handle(payload).await {
            Ok(result) => ChildMessage::Result {
                correlation_id,
                result,
            },
            Err(message) => ChildMessage::Error {
                correlation_id,
                message,
            },
        };

        let encoded = match encode_line(&reply) {
            Ok(encoded) => encoded,
            Err(e) => encode_line(&ChildMessage::Error {
                correlation_id,
                message: e.to_string(),
            })
            .map_err(std::io::Error::other)?,
        };
        output.write_all(encoded.as_bytes()).await?;
        output.flush().await?;
    }

    debug!("Input closed, worker loop finished");
    Ok(())
}

fn into_io(err: ProtocolError) -> std::io::Error {
    match err {
        ProtocolError::Io(e) => e,
        other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
    }
}
