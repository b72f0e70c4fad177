//! Worker process for compute-offload.
//!
//! Speaks the line-delimited JSON protocol on stdin/stdout; logs go to stderr.

use compute_offload::child::{self, BuiltinOps};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // stdout carries protocol messages, so logs must stay on stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(pid = std::process::id(), "Worker started");
    child::serve(&BuiltinOps).await?;
    Ok(())
}
