use healer_core::{HealerConfig, RemediationLoop};
use healer_server::actuators::Actuators;
use healer_server::api::{router, AppState};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run().await {
        error!(error = %err, "pipeline-healer stopped");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = HealerConfig::from_env();
    let actuator = Actuators::from_config(&config)?;
    info!(
        actuator = actuator.describe(),
        base_url = %config.actuator_base_url,
        model_backed = config.llm.is_some(),
        "starting pipeline-healer"
    );

    let healer = RemediationLoop::from_config(&config, Arc::new(actuator))?;
    let app = router(AppState::new(Arc::new(healer)));

    let bind = std::env::var("HEALER_BIND").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "pipeline-healer listening");
    axum::serve(listener, app).await?;
    Ok(())
}
