use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Invalid RTP packet: {0}")]
    Rtp(String),

    #[error("Empty payload")]
    EmptyPayload,

    #[error("Forbidden zero bit set in NAL header {0:#04x}")]
    ForbiddenBit(u8),

    #[error("Truncated {0} packet")]
    Truncated(&'static str),

    #[error("Unsupported packetization type {0}")]
    Unsupported(u8),

    #[error("Access unit exceeds {0} bytes")]
    AccessUnitTooLarge(usize),
}

pub type Result<T> = std::result::Result<T, MediaError>;
