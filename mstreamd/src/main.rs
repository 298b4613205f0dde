//! Main entry point for the binary daemon
mod http;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use mstream::config::{Connections, Settings};
use mstream::metrics::Metrics;
use mstream::Streamer;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Span};
use tracing_subscriber::EnvFilter;

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// MongoDB change stream to RabbitMQ streamer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file (YAML)
    #[arg(short, long, default_value = "/app/config.yaml")]
    config: String,
    /// Prefix for environment variables
    #[arg(short, long, default_value = "MSTREAM")]
    prefix: String,
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let env = || {
        config::Environment::with_prefix(&cli.prefix)
            .separator("__")
            .try_parsing(true)
    };

    let connections = config::Config::builder()
        .add_source(env())
        .build()?
        .try_deserialize::<Connections>()
        .context("Failed to read connection settings from the environment")?;

    let settings = config::Config::builder()
        .add_source(config::File::with_name(&cli.config))
        .add_source(env())
        .build()?
        .try_deserialize::<Settings>()
        .with_context(|| format!("Failed to read settings from {}", cli.config))?;

    Settings::new(connections, settings)
        .map_err(|e| anyhow::anyhow!("Failed to create settings: {}", e))
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

/// Keep a streamer running until `cancel` fires, restarting it whenever its
/// change stream fails or ends. Each restart resumes from the last checkpoint.
///
/// Returns the live streamer at shutdown, if any. Failing to start a streamer
/// is fatal.
async fn supervise(
    settings: &Settings,
    metrics: &Metrics,
    span: &Span,
    cancel: &CancellationToken,
) -> Result<Option<Streamer>> {
    loop {
        let mut streamer = tokio::select! {
            streamer = Streamer::new(settings, metrics.clone(), span.clone()) => {
                streamer.context("Failed to start streamer")?
            }
            _ = cancel.cancelled() => {
                info!("Shutdown requested before the streamer started");
                return Ok(None);
            }
        };

        let result = streamer.stream(cancel.clone()).await;
        if cancel.is_cancelled() {
            if let Err(e) = result {
                warn!(error = %e, "Streamer failed during shutdown");
            }
            return Ok(Some(streamer));
        }
        match result {
            Ok(()) => warn!("Change stream ended, restarting streamer"),
            Err(e) => error!(error = %e, "Streamer failed, restarting"),
        }
        if let Err(e) = streamer.close().await {
            error!(error = %e, "Failed to close streamer before restart");
        }

        tokio::select! {
            _ = tokio::time::sleep(RESTART_DELAY) => {}
            _ = cancel.cancelled() => return Ok(None),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting mstream");

    let settings = load_settings(&cli)?;
    let metrics = Metrics::new();
    let span = info_span!(
        "mstream",
        db = %settings.watched().db_name,
        coll = %settings.watched().coll_name,
        stream = %settings.rabbitmq().stream_name,
    );

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let listener = tokio::net::TcpListener::bind(&settings.http().addr)
        .await
        .with_context(|| format!("Failed to bind HTTP server to {}", settings.http().addr))?;
    let http_server = tokio::spawn(http::serve(listener, metrics.clone(), cancel.clone()));

    let streamer = match supervise(&settings, &metrics, &span, &cancel).await {
        Ok(streamer) => streamer,
        Err(e) => {
            cancel.cancel();
            let _ = http_server.await;
            return Err(e);
        }
    };
    cancel.cancel();

    let shutdown = async {
        match http_server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
            Err(e) => error!(error = %e, "HTTP server task panicked"),
        }
        match streamer {
            Some(streamer) => streamer.close().await,
            None => Ok(()),
        }
    };
    match tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(Ok(())) => info!("Shutdown complete"),
        Ok(Err(e)) => {
            error!(error = %e, "Shutdown finished with errors");
            return Err(e.into());
        }
        Err(_) => warn!(
            "Graceful shutdown did not finish within {:?}",
            GRACEFUL_SHUTDOWN_TIMEOUT
        ),
    }
    Ok(())
}
