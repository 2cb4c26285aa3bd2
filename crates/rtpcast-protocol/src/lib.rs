//! Wire types shared by the rtpcast server and its viewers.
//!
//! Every frame on the message channel is a JSON object `{ "event", "data" }`
//! where `data` is itself an encoded, event-specific string.

pub mod messages;
pub mod types;

pub use messages::{Event, ProtocolError, SignalMessage};
pub use types::Info;
