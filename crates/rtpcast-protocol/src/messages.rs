use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Info;

/// Closed set of events carried by the signaling envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Event {
    /// Server session description
    Offer,
    /// Viewer session description
    Answer,
    /// Trickled ICE candidate, either direction
    Candidate,
    /// Hub statistics
    Info,
    /// Viewer count after a session closed
    Connections,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::Offer => "offer",
            Event::Answer => "answer",
            Event::Candidate => "candidate",
            Event::Info => "info",
            Event::Connections => "connections",
        }
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid {event} payload: {source}")]
    Payload {
        event: Event,
        #[source]
        source: serde_json::Error,
    },
}

/// Envelope exchanged over the message channel in both directions
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignalMessage {
    pub event: Event,
    pub data: String,
}

/// Envelope as it appears on the wire, before the event name is checked
#[derive(Deserialize)]
struct RawMessage {
    event: String,
    #[serde(default)]
    data: String,
}

impl SignalMessage {
    pub fn new(event: Event, data: impl Into<String>) -> Self {
        Self {
            event,
            data: data.into(),
        }
    }

    /// Wrap a serializable payload, encoding it as the `data` string
    pub fn with_payload<T: Serialize>(event: Event, payload: &T) -> Result<Self, ProtocolError> {
        let data = serde_json::to_string(payload)
            .map_err(|source| ProtocolError::Payload { event, source })?;
        Ok(Self { event, data })
    }

    /// Viewer count notice; the count is sent as a bare decimal integer
    pub fn connections(count: usize) -> Self {
        Self::new(Event::Connections, count.to_string())
    }

    pub fn info(info: &Info) -> Result<Self, ProtocolError> {
        Self::with_payload(Event::Info, info)
    }

    /// Decode the event-specific payload carried in `data`
    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(&self.data).map_err(|source| ProtocolError::Payload {
            event: self.event,
            source,
        })
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(frame).map_err(ProtocolError::Malformed)?;
        let event = serde_json::from_value(serde_json::Value::String(raw.event.clone()))
            .map_err(|_| ProtocolError::UnknownEvent(raw.event))?;
        Ok(Self {
            event,
            data: raw.data,
        })
    }

    pub fn encode(&self) -> String {
        // A unit enum and a string never fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}
