use rtpcast_protocol::{Event, ProtocolError};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures of the message channel carrying signaling frames
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Message channel closed")]
    Closed,

    #[error("Binary frames are not part of the signaling protocol")]
    UnexpectedBinary,

    #[error("Message channel transport error: {0}")]
    Transport(String),

    #[error("Write to message channel did not finish within {0:?}")]
    WriteTimeout(Duration),
}

/// Ends one viewer session; never affects other sessions or ingest
#[derive(Error, Debug)]
pub enum SignalError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Unexpected {0} event from viewer")]
    UnexpectedEvent(Event),

    #[error("No frame from viewer within {0:?}")]
    KeepaliveExpired(Duration),

    #[error("More than {0} candidates buffered before the answer")]
    TooManyCandidates(usize),

    #[error("Transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error(transparent)]
    Hub(#[from] HubClosed),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Control-plane hub is no longer running")]
pub struct HubClosed;

/// Ingest failures that abort the process
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to bind ingest socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Ingest socket receive failed: {0}")]
    Receive(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SignalError>;
