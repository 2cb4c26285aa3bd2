//! Media processing for rtpcast
//!
//! This crate provides the ingest-side media handling:
//! - RTP datagram decoding
//! - H.264 NAL unit parsing and RFC 6184 depacketization
//! - Access unit reassembly that keeps every IDR frame self-decodable

pub mod error;
pub mod h264;
pub mod reassembler;
pub mod rtp;

pub use error::{MediaError, Result};
pub use h264::{NalUnit, NalUnitType, START_CODE};
pub use reassembler::{NalReassembler, NalSample};
pub use rtp::parse_rtp;
