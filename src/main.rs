use anyhow::Result;
use gridwise::config::Config;
use gridwise::controller::Controller;
use gridwise::home_assistant::HomeAssistantClient;
use gridwise::notify::{HomeAssistantMetrics, HomeAssistantNotifier};
use gridwise::plant::HomeAssistantPlant;
use gridwise::pricing::AmberClient;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    config.validate()?;

    gridwise::logging::init_logging(&config.logging)?;
    info!(
        "Gridwise {} starting up (timezone {})",
        env!("APP_VERSION"),
        config.timezone
    );

    let ha = HomeAssistantClient::new(&config.home_assistant)?;
    let plant = Arc::new(HomeAssistantPlant::new(
        ha.clone(),
        config.plant.entities.clone(),
    ));
    let feed = Arc::new(AmberClient::new(&config.amber)?);
    let notifier = Arc::new(HomeAssistantNotifier::new(ha.clone(), &config.notifications));
    let metrics = Arc::new(HomeAssistantMetrics::new(ha, &config.metrics));

    let mut controller = Controller::new(config, plant, feed, notifier, metrics)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create controller: {}", e))?;

    let shutdown = controller.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, shutting down");
                let _ = shutdown.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    match controller.run().await {
        Ok(()) => {
            info!("Controller shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Controller failed with error: {}", e);
            Err(anyhow::anyhow!("Controller error: {}", e))
        }
    }
}
