use serde::{Deserialize, Serialize};

/// Hub statistics pushed to every connected viewer as an `info` event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Info {
    pub no_connections: usize,
}

impl Info {
    pub fn new(no_connections: usize) -> Self {
        Self { no_connections }
    }
}
