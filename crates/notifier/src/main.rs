use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use herald_events::kafka::{KafkaBroker, KafkaConfig};
use herald_events::{ConsumerWorker, SmtpMailer};
use herald_notifier::{build_dispatcher, init_tracing, NotifierConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = NotifierConfig::from_env().context("invalid notifier configuration")?;
    let kafka = KafkaConfig::from_env().context("invalid Kafka configuration")?;
    tracing::info!(
        topic = %config.consumer.topic,
        group = %config.consumer.group,
        brokers = %kafka.brokers,
        "Loaded notifier configuration",
    );

    // --- Broker and mail transport ---
    let broker = Arc::new(KafkaBroker::connect(&kafka).context("failed to create Kafka client")?);
    let mailer = Arc::new(SmtpMailer::new(&config.email).context("failed to build SMTP mailer")?);

    // --- Consumer ---
    let dispatcher = build_dispatcher(&config, mailer, broker.clone());
    let worker = ConsumerWorker::new(
        broker,
        dispatcher,
        config.consumer.topic.clone(),
        config.consumer.group.clone(),
    );

    let cancel = CancellationToken::new();
    let run = worker.run(cancel.clone());
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => {
            result.context("consumer failed")?;
            tracing::warn!("Consumer stopped on its own");
        }
        () = shutdown_signal() => {
            cancel.cancel();
            run.await.context("consumer failed during shutdown")?;
        }
    }

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT (Ctrl-C) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
