use anyhow::Context;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use expense_settlement::{bootstrap, config::AppConfig, server};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,expense_settlement=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting expense settlement service");

    let config = AppConfig::from_env().context("failed to load configuration")?;

    let state = bootstrap::initialize_app_state(&config)
        .await
        .context("failed to initialize application state")?;

    let app = server::create_app(state, &config.cors_origins());

    server::run_server(app, &config.bind_address).await?;

    info!("Server stopped");
    Ok(())
}
