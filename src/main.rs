//! gcli2api - HTTP server entry point.

use gcli2api::{api, Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gcli2api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: storage={}",
        if config.postgres_dsn.is_some() {
            "postgres"
        } else if config.valkey_url.is_some() {
            "valkey"
        } else {
            "file"
        }
    );

    api::serve(config).await?;

    Ok(())
}
