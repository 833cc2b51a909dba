//! Rate Shield service
//!
//! Main entry point: wires the engine, the cleanup scheduler, the metrics
//! exporter, and the HTTP server together.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;

use rate_shield::api::{self, ApiState};
use rate_shield::config::load_config;
use rate_shield::core::RateLimiter;
use rate_shield::models::default_rule_configs;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Rate Shield service...");

    // Load configuration
    let config = load_config().context("failed to load configuration")?;
    let config = Arc::new(config);

    // Install the Prometheus recorder; rendered at GET /metrics
    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    // Construct the engine with the recommended per-rule defaults
    let limiter = Arc::new(RateLimiter::new(
        default_rule_configs(),
        config.detection.clone(),
    ));

    // Host-side cleanup scheduler; the engine never schedules itself
    {
        let limiter = limiter.clone();
        let interval_seconds = config.cleanup.interval_seconds;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
            loop {
                interval.tick().await;
                if let Err(e) = limiter.cleanup_expired_data().await {
                    error!("cleanup sweep failed: {}", e);
                }
            }
        });
    }

    // Create API state
    let state = web::Data::new(ApiState {
        limiter,
        config: config.clone(),
        metrics: Some(metrics_handle),
    });

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))
        .context("failed to bind server address")?
        .run()
        .await
        .context("server terminated with an error")
}
