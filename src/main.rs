use anyhow::Result;
use fieldgate::{Config, TelemetryAgent};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    fieldgate::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Fieldgate {} starting up", env!("APP_VERSION"));

    let agent = TelemetryAgent::new(&config)
        .map_err(|e| anyhow::anyhow!("Failed to build agent: {}", e))?;

    let shutdown = agent.shutdown_sender();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing the current cycle");
            let _ = shutdown.send(true);
        }
    });

    match agent.run().await {
        Ok(state) => {
            info!("Fieldgate shutdown complete after {} cycles", state.cycles);
            Ok(())
        }
        Err(e) => {
            error!("Agent failed with error: {}", e);
            Err(anyhow::anyhow!("Agent error: {}", e))
        }
    }
}
