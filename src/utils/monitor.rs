use anyhow::{Result, Context};
use axum::{extract::State, http::header, response::IntoResponse, routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cli::config::MonitoringSettings;
use crate::crawler::stats::TaskStats;
use crate::utils::metrics::MetricsCollector;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// A running monitoring sink: the stats consumer plus its HTTP endpoint
pub struct Monitor {
    pub collector: MetricsCollector,
    consumer: JoinHandle<()>,
    server: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Monitor {
    /// Start consuming stats and serving `/metrics` on the configured port
    ///
    /// Returns the sender storage workers push stats into.
    pub async fn start(settings: &MonitoringSettings) -> Result<(Self, mpsc::Sender<TaskStats>)> {
        let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
        let listener = TcpListener::bind(addr).await
            .context(format!("Failed to bind monitoring endpoint on {}", addr))?;
        info!("Serving metrics on http://{}/metrics", addr);

        let collector = MetricsCollector::new();
        let (stats_tx, stats_rx) = mpsc::channel(settings.stats_buffer);
        let shutdown = CancellationToken::new();

        let consumer = tokio::spawn(consume_stats(collector.clone(), stats_rx));
        let server = {
            let collector = collector.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(listener, collector, shutdown).await {
                    error!("Monitoring endpoint failed: {:#}", e);
                }
            })
        };

        Ok((Self { collector, consumer, server, shutdown }, stats_tx))
    }

    /// Wait for every stats sender to be dropped, then stop the endpoint
    pub async fn stop(self) {
        if let Err(e) = self.consumer.await {
            error!("Stats consumer terminated abnormally: {}", e);
        }
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            error!("Monitoring endpoint terminated abnormally: {}", e);
        }
        debug!("Monitoring stopped");
    }
}

/// Fold stats into the collector until the channel closes
pub async fn consume_stats(collector: MetricsCollector, mut stats_rx: mpsc::Receiver<TaskStats>) {
    while let Some(stats) = stats_rx.recv().await {
        collector.record(&stats).await;
    }
}

pub fn router(collector: MetricsCollector) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(collector)
}

/// Serve the metrics router until `shutdown` is cancelled
pub async fn serve(listener: TcpListener, collector: MetricsCollector, shutdown: CancellationToken) -> Result<()> {
    axum::serve(listener, router(collector))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server error")
}

async fn metrics_handler(State(collector): State<MetricsCollector>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], collector.render().await)
}
