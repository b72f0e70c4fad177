use compute_offload::config::{AdmissionPolicy, OffloadConfig};
use compute_offload::dispatch::Dispatcher;
use compute_offload::gateway::gateway_routes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OffloadConfig::from_env()?;
    let dispatcher = Dispatcher::new(config.dispatcher);
    let dispatcher_config = dispatcher.config();

    eprintln!("compute-offload v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Gateway: http://{}", config.bind);
    eprintln!("   Worker: {}", dispatcher_config.program);
    eprintln!(
        "   Workers: max {} live, {}",
        dispatcher_config.max_workers,
        match dispatcher_config.admission {
            AdmissionPolicy::FailFast => "fail fast when full".to_string(),
            AdmissionPolicy::Queue { max_waiting } => format!("queue up to {max_waiting} when full"),
        }
    );
    eprintln!("   Timeout: {:?}\n", dispatcher_config.default_timeout);

    let app = gateway_routes(dispatcher.clone());

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %config.bind, "Gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    dispatcher.shutdown().await;
    tracing::info!("Gateway stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown requested");
}
