use std::io::Write;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use revaudit::{Config, DateRange, Extractor, http::ReqwestHttpClient, telemetry};
use tokio_util::sync::CancellationToken;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, returning partial snapshot...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, returning partial snapshot...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before anything else that might build a TLS client
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let args = revaudit::config::Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let date_range = match (args.start, args.end) {
        (Some(start), Some(end)) => DateRange::from_dates(start, end)?,
        _ => DateRange::trailing_days(Utc::now().date_naive(), args.days)?,
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let client = ReqwestHttpClient::new(&config.api)?;
    let extractor = Extractor::new(client, &config);
    let result = extractor.extract(date_range, cancel).await;

    let outcome = match result {
        Ok(snapshot) => {
            let json = serde_json::to_string_pretty(&snapshot)?;
            match &args.output {
                Some(path) => std::fs::write(path, json + "\n")
                    .with_context(|| format!("Failed to write snapshot to {}", path.display())),
                None => {
                    let mut stdout = std::io::stdout().lock();
                    writeln!(stdout, "{json}").context("Failed to write snapshot to stdout")
                }
            }
        }
        Err(e) => Err(e.into()),
    };

    telemetry::shutdown_telemetry();
    outcome
}
