use crate::state::AppState;
use crate::ws;
use axum::{extract::State, routing::get, Json, Router};
use rtpcast_protocol::Info;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // Relay status
        .route("/api/info", get(get_info))
        // Viewer signaling
        .route("/websocket", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn get_info(State(state): State<AppState>) -> Json<Info> {
    Json(state.hub.info())
}
