use anyhow::Result;
use rtpcast_server::state::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtpcast_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting rtpcast relay...");

    // Load configuration
    let config = Config::load()?;
    let bind_address = config.bind_address.clone();

    let app = rtpcast_server::create_app(config).await?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    let ingest = tokio::spawn(app.ingest.run());

    tokio::select! {
        served = axum::serve(listener, app.router).into_future() => served?,
        ingested = ingest => {
            // The relay is useless without its source
            ingested??;
            anyhow::bail!("Ingest loop stopped");
        }
    }

    Ok(())
}
