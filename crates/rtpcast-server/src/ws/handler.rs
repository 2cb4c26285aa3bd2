use crate::signaling::run_session;
use crate::state::AppState;
use crate::ws::WebSocketChannel;
use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

/// Largest signaling frame a viewer may send
pub const MAX_FRAME_SIZE: usize = 4096;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(MAX_FRAME_SIZE)
        .max_frame_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| async move {
            tracing::debug!("Viewer connected");
            if let Err(e) = run_session(state.signaling(), WebSocketChannel::new(socket)).await {
                tracing::warn!("Viewer session ended with error: {}", e);
            }
        })
}
