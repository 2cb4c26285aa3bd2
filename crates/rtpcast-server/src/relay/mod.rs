//! Fan-out of the ingest stream to viewer sessions
//!
//! The broadcast source has exactly one writer, the ingest pump, and one sink
//! per attached viewer track. The session registry tracks every live viewer
//! and evicts the ones whose transport has closed.

mod registry;
mod session;
mod source;

pub use registry::{EvictionOutcome, RegistryConfig, SessionRegistry};
pub use session::{SessionState, ViewerSession};
pub use source::{BroadcastSource, BroadcastWriter, MediaPayload, MediaSink, TrackKind};

#[cfg(test)]
pub(crate) use source::tests::RecordingSink;
