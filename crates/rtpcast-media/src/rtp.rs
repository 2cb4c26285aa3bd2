//! RTP datagram decoding

use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

use crate::error::{MediaError, Result};

/// Decode one UDP datagram as one RTP packet
pub fn parse_rtp(datagram: &[u8]) -> Result<Packet> {
    let mut buf = datagram;
    let packet = Packet::unmarshal(&mut buf).map_err(|e| MediaError::Rtp(e.to_string()))?;
    if packet.header.version != 2 {
        return Err(MediaError::Rtp(format!(
            "unsupported version {}",
            packet.header.version
        )));
    }
    Ok(packet)
}
