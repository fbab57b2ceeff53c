use research_orchestrator::{api::start_server, config::ResearchConfig, context::AppContext};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ResearchConfig::from_env()?;
    let port = config.port;

    info!("Research Orchestrator - API Server");
    info!("Port: {}", port);

    let context = Arc::new(AppContext::open(config).await?);
    info!("Application context initialized");

    start_server(Arc::clone(&context), port).await?;

    context.close().await?;
    Ok(())
}
