//! Viewer session bookkeeping shared between the signaling task and the registry

use crate::signaling::{TransportSession, TransportState};
use rtpcast_protocol::SignalMessage;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Signaling lifecycle of one viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Negotiating = 1,
    Connected = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Negotiating,
            2 => SessionState::Connected,
            _ => SessionState::Closed,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

pub struct ViewerSession {
    id: Uuid,
    transport: Arc<dyn TransportSession>,
    /// Frames queued for the session's message channel
    outbound: mpsc::UnboundedSender<String>,
    state: AtomicU8,
    torn_down: AtomicBool,
}

impl ViewerSession {
    pub fn new(
        id: Uuid,
        transport: Arc<dyn TransportSession>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id,
            transport,
            outbound,
            state: AtomicU8::new(SessionState::Connecting as u8),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn TransportSession> {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `state`; `Closed` is terminal and never left
    pub fn set_state(&self, state: SessionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Closed as u8).then_some(state as u8)
            });
    }

    /// True once either the session or its transport reached the terminal state
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
            || self.transport.state() == TransportState::Closed
    }

    /// Sender feeding the session's message channel
    pub fn outbound_sender(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    /// Queue a message for the viewer; false when the channel is gone
    pub fn send(&self, message: &SignalMessage) -> bool {
        self.outbound.send(message.encode()).is_ok()
    }

    /// Returns true exactly once, for whichever caller starts teardown first
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for ViewerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerSession")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
