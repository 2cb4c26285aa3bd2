//! rtpcast server library
//!
//! This module exposes the relay components for testing and embedding.

pub mod api;
pub mod error;
pub mod ingest;
pub mod relay;
pub mod signaling;
pub mod state;
pub mod webrtc;
pub mod ws;

use anyhow::Result;
use std::sync::Arc;

/// A relay ready to run: the HTTP surface plus the ingest loop that feeds it
pub struct App {
    pub router: axum::Router,
    pub ingest: ingest::IngestPump,
    pub state: state::AppState,
}

/// Create and configure the relay.
///
/// Binds the ingest socket and spawns the hub; the caller drives the
/// returned ingest pump and serves the router.
pub async fn create_app(config: state::Config) -> Result<App> {
    let (source, writer) = relay::BroadcastSource::new(config.options.track_kinds());
    let registry = relay::SessionRegistry::new(relay::RegistryConfig::default());

    let (hub, hub_handle) = ws::Hub::new();
    tokio::spawn(hub.run());

    let transports = Arc::new(webrtc::RtcTransportFactory::new(&config)?);

    let ingest = ingest::IngestPump::bind(
        config.ingest_socket_addr(),
        writer,
        ingest::IngestOptions::from_config(&config),
    )
    .await?;

    let state = state::AppState {
        config,
        source,
        registry,
        hub: hub_handle,
        transports,
    };
    let router = api::create_router(state.clone());

    Ok(App {
        router,
        ingest,
        state,
    })
}
