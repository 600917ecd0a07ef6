use bacprop::config::GatewayConfig;
use bacprop::service::BacPropagator;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    info!("Starting bacprop...");

    let config = GatewayConfig::load()?;
    BacPropagator::new(config).run().await?;

    info!("bacprop stopped");
    Ok(())
}
