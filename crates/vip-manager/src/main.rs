//! VIP manager binary

use vip_manager::{Config, Manager, MetricsServer, setup_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing is not initialized yet, so configuration errors go to stderr.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    let _telemetry_guard = setup_tracing(&config.logging, &config.telemetry)?;

    tracing::info!("VIP manager starting");

    let metrics_settings = config.metrics.clone();
    let manager = Manager::new(config).await?;

    let metrics_handle = metrics_settings.enabled.then(|| {
        let server = MetricsServer::new(manager.metrics(), metrics_settings.listen_addr);
        let shutdown = manager.shutdown().token();
        tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                tracing::warn!(error = %e, "Metrics server error");
            }
        })
    });

    let engines = manager.cluster_engines();
    let result = manager.start(&engines).await;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    result?;
    tracing::info!("VIP manager stopped");
    Ok(())
}
