pub mod channel;
pub mod handler;
pub mod hub;

pub use channel::WebSocketChannel;
pub use hub::{Hub, HubHandle};
