//! Job dispatcher service.
//!
//! Reads its configuration from the environment (or `.env`), declares the
//! dispatcher topology and consumes the intake and result queues until
//! SIGINT/SIGTERM.

use anyhow::Context;

use jobchain_infra::{AmqpBroker, Dispatcher, DispatcherConfig};
use jobchain_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DispatcherConfig::from_env().context("invalid dispatcher configuration")?;
    let _log_guard = jobchain_observability::init(&LogConfig::from_env());

    let broker = AmqpBroker::connect(&config.amqp)
        .await
        .with_context(|| format!("failed to connect to {}:{}", config.amqp.host, config.amqp.port))?;

    let dispatcher = Dispatcher::new(broker, config.queues);
    dispatcher.init().await.context("failed to declare topology")?;

    let result = dispatcher.run(shutdown_signal()).await;

    if let Err(err) = dispatcher.into_broker().close().await {
        tracing::warn!(error = %err, "failed to close broker connection cleanly");
    }
    result.context("dispatcher stopped with an error")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
