use investigation_orchestrator::{api::start_server, Config, Orchestrator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    if config.gemini_api_key.is_none() {
        warn!("GEMINI_API_KEY not set - using template questions");
    }

    info!("Investigation Orchestrator - API Server");
    info!(port = config.port, "Configuration loaded");

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?);

    // sweep at a fraction of the idle timeout, never busier than once a second
    let sweep = (config.orchestrator.idle_timeout / 4).max(Duration::from_secs(1));
    orchestrator.spawn_idle_reaper(sweep);

    info!("Orchestrator initialized");

    start_server(orchestrator, config.port).await?;

    Ok(())
}
