//! Health and Prometheus endpoints.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use mstream::metrics::Metrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

async fn health() -> &'static str {
    "OK"
}

async fn metrics(State(metrics): State<Metrics>) -> Result<String, StatusCode> {
    metrics.export().map_err(|e| {
        error!(error = %e, "Failed to export metrics");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

pub fn router(metrics_collector: Metrics) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(metrics_collector)
}

/// Serve the router on `listener` until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    metrics: Metrics,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    info!(addr = ?listener.local_addr()?, "HTTP server listening");
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start(metrics: Metrics) -> (String, CancellationToken, tokio::task::JoinHandle<std::io::Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(serve(listener, metrics, cancel.clone()));
        (base, cancel, handle)
    }

    #[tokio::test]
    async fn test_health() {
        let (base, cancel, handle) = start(Metrics::new()).await;

        let response = reqwest::get(format!("{base}/health")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_metrics_exposes_counters() {
        let metrics = Metrics::new();
        metrics.record_received("app", "users");
        metrics.record_handle_success("app", "users");
        let (base, cancel, handle) = start(metrics).await;

        let body = reqwest::get(format!("{base}/metrics"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains(r#"mstream_change_stream_received_total{collection="users",database="app"} 1"#));
        assert!(body.contains("mstream_change_stream_handle_event_success_total"));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
