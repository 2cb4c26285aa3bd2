//! Capabilities consumed from the real-time transport engine and the message channel

use crate::error::ChannelError;
use crate::relay::{MediaSink, TrackKind};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Transport connectivity as observed by signaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Asynchronous notifications from a transport session
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A local candidate to trickle to the viewer
    LocalCandidate(RTCIceCandidateInit),
    StateChanged(TransportState),
}

/// Queue a transport pushes its events into
pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// One viewer's real-time transport session
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<RTCSessionDescription>;

    async fn set_local_description(&self, description: RTCSessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&self, description: RTCSessionDescription)
    -> anyhow::Result<()>;

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> anyhow::Result<()>;

    /// Add a send-only track of `kind` and return the sink feeding it
    async fn attach_outbound_track(&self, kind: TrackKind) -> anyhow::Result<Arc<dyn MediaSink>>;

    fn state(&self) -> TransportState;

    /// Close the session; closing twice is not an error
    async fn close(&self) -> anyhow::Result<()>;
}

/// Creates transport sessions wired to an event queue
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, events: TransportEvents) -> anyhow::Result<Arc<dyn TransportSession>>;
}

/// Inbound traffic from a viewer that matters to signaling
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A signaling envelope
    Text(String),
    /// Keepalive answer; only proves the viewer is still reading
    Pong,
}

/// Bidirectional framed text channel to one viewer.
///
/// Split once per session: the write half goes to a dedicated writer task
/// so a viewer that stops reading can never stall the receive loop.
pub trait MessageChannel: Send + 'static {
    type Writer: FrameWriter;
    type Reader: FrameReader;

    fn split(self) -> (Self::Writer, Self::Reader);
}

#[async_trait]
pub trait FrameWriter: Send + 'static {
    async fn send(&mut self, frame: String) -> Result<(), ChannelError>;

    async fn ping(&mut self) -> Result<(), ChannelError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait FrameReader: Send + 'static {
    /// Next inbound frame, `None` once the viewer has gone away
    async fn receive(&mut self) -> Option<Result<Inbound, ChannelError>>;
}
