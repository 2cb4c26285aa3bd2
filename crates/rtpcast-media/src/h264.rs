//! H.264 NAL unit parsing and RTP depacketization
//!
//! NAL unit header:
//! ```text
//! +---------------+
//! |0|1|2|3|4|5|6|7|
//! +-+-+-+-+-+-+-+-+
//! |F|NRI|  Type   |
//! +---------------+
//! ```
//!
//! RTP payload structures handled (RFC 6184, packetization-mode=1):
//! - 1..=23: single NAL unit packet
//! - 24: STAP-A, `{ size (2) | NAL unit }*` after the STAP-A header
//! - 28: FU-A, FU indicator (1) | FU header `S|E|R|Type` (1) | fragment

use bytes::{Bytes, BytesMut};

use crate::error::{MediaError, Result};

/// Annex B start code prefixed to every NAL unit leaving the reassembler
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const STAP_A: u8 = 24;
const FU_A: u8 = 28;

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// Coded slice of a non-IDR picture
    CodedSliceNonIdr,
    /// Coded slice of an IDR picture (keyframe)
    CodedSliceIdr,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Anything else (SEI, AUD, filler, ...)
    Other(u8),
}

impl NalUnitType {
    pub fn from_header(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::CodedSliceNonIdr,
            5 => NalUnitType::CodedSliceIdr,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            other => NalUnitType::Other(other),
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }
}

impl std::fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalUnitType::CodedSliceNonIdr => f.write_str("CodedSliceNonIdr"),
            NalUnitType::CodedSliceIdr => f.write_str("CodedSliceIdr"),
            NalUnitType::Sps => f.write_str("SPS"),
            NalUnitType::Pps => f.write_str("PPS"),
            NalUnitType::Other(t) => write!(f, "Other({})", t),
        }
    }
}

/// A single NAL unit without start code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub unit_type: NalUnitType,
    pub data: Bytes,
}

impl NalUnit {
    pub fn parse(data: Bytes) -> Result<Self> {
        let header = *data.first().ok_or(MediaError::EmptyPayload)?;
        if header & 0x80 != 0 {
            return Err(MediaError::ForbiddenBit(header));
        }
        Ok(Self {
            unit_type: NalUnitType::from_header(header),
            data,
        })
    }

    /// Append this unit, start code first, to `out`
    pub fn write_annex_b(&self, out: &mut BytesMut) {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(&self.data);
    }
}

/// Turns RTP payloads into whole NAL units
#[derive(Debug, Default)]
pub struct Depacketizer {
    /// FU-A fragments of the unit currently being rebuilt
    fu_buffer: BytesMut,
    in_fu: bool,
    /// Sequence number of the last fragment appended to `fu_buffer`
    last_fu_sequence: u16,
}

impl Depacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially rebuilt fragmented unit
    pub fn reset(&mut self) {
        self.fu_buffer.clear();
        self.in_fu = false;
    }

    /// Depacketize one RTP payload, appending completed units to `out`.
    ///
    /// On error nothing is appended and any fragment in progress is discarded.
    pub fn push(&mut self, payload: &Bytes, sequence_number: u16, out: &mut Vec<NalUnit>) -> Result<()> {
        let indicator = *payload.first().ok_or(MediaError::EmptyPayload)?;
        if indicator & 0x80 != 0 {
            self.reset();
            return Err(MediaError::ForbiddenBit(indicator));
        }

        match indicator & 0x1F {
            1..=23 => {
                out.push(NalUnit::parse(payload.clone())?);
                Ok(())
            }
            STAP_A => self.push_stap_a(payload.slice(1..), out),
            FU_A => self.push_fu_a(payload, sequence_number, out),
            other => Err(MediaError::Unsupported(other)),
        }
    }

    fn push_stap_a(&mut self, data: Bytes, out: &mut Vec<NalUnit>) -> Result<()> {
        let mut units = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            if pos + 2 > data.len() {
                return Err(MediaError::Truncated("STAP-A"));
            }
            let size = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            if size == 0 || pos + size > data.len() {
                return Err(MediaError::Truncated("STAP-A"));
            }
            units.push(NalUnit::parse(data.slice(pos..pos + size))?);
            pos += size;
        }
        out.extend(units);
        Ok(())
    }

    fn push_fu_a(&mut self, payload: &Bytes, sequence_number: u16, out: &mut Vec<NalUnit>) -> Result<()> {
        if payload.len() < 3 {
            self.reset();
            return Err(MediaError::Truncated("FU-A"));
        }
        let indicator = payload[0];
        let fu_header = payload[1];
        let start = fu_header & 0x80 != 0;
        let end = fu_header & 0x40 != 0;

        if start {
            self.fu_buffer.clear();
            self.fu_buffer.extend_from_slice(&[(indicator & 0xE0) | (fu_header & 0x1F)]);
            self.in_fu = true;
        } else if !self.in_fu {
            // Middle or end fragment whose start was lost
            return Ok(());
        } else if sequence_number != self.last_fu_sequence.wrapping_add(1) {
            tracing::debug!(
                "FU-A gap: expected seq {}, got {}",
                self.last_fu_sequence.wrapping_add(1),
                sequence_number
            );
            self.reset();
            return Ok(());
        }

        self.fu_buffer.extend_from_slice(&payload[2..]);
        self.last_fu_sequence = sequence_number;

        if end {
            self.in_fu = false;
            let unit = self.fu_buffer.split().freeze();
            out.push(NalUnit::parse(unit)?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depacketize(payloads: &[(&[u8], u16)]) -> Vec<NalUnit> {
        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        for (payload, seq) in payloads {
            let _ = depacketizer.push(&Bytes::copy_from_slice(payload), *seq, &mut out);
        }
        out
    }

    #[test]
    fn test_unit_type_from_header() {
        assert_eq!(NalUnitType::from_header(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from_header(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from_header(0x65), NalUnitType::CodedSliceIdr);
        assert_eq!(NalUnitType::from_header(0x41), NalUnitType::CodedSliceNonIdr);
        assert_eq!(NalUnitType::from_header(0x06), NalUnitType::Other(6));
    }

    #[test]
    fn test_single_nal_unit() {
        let units = depacketize(&[(&[0x41, 0x9a, 0x02], 1)]);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_type, NalUnitType::CodedSliceNonIdr);
        assert_eq!(&units[0].data[..], &[0x41, 0x9a, 0x02]);
    }

    #[test]
    fn test_stap_a_splits_units() {
        let stap = [0x18, 0x00, 0x02, 0x67, 0x42, 0x00, 0x02, 0x68, 0xce];
        let units = depacketize(&[(&stap, 1)]);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].unit_type, NalUnitType::Sps);
        assert_eq!(&units[1].data[..], &[0x68, 0xce]);
    }

    #[test]
    fn test_truncated_stap_a_emits_nothing() {
        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        let stap = Bytes::from_static(&[0x18, 0x00, 0x02, 0x67, 0x42, 0x00, 0x09, 0x68]);
        assert_eq!(
            depacketizer.push(&stap, 1, &mut out),
            Err(MediaError::Truncated("STAP-A"))
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_fu_a_reassembly() {
        // IDR split in three fragments, NRI bits carried by the indicator
        let units = depacketize(&[
            (&[0x7c, 0x85, 0x01, 0x02], 10),
            (&[0x7c, 0x05, 0x03], 11),
            (&[0x7c, 0x45, 0x04], 12),
        ]);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_type, NalUnitType::CodedSliceIdr);
        assert_eq!(&units[0].data[..], &[0x65, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_fu_a_gap_drops_unit() {
        let units = depacketize(&[
            (&[0x7c, 0x85, 0x01], 10),
            (&[0x7c, 0x45, 0x04], 12),
        ]);
        assert!(units.is_empty());
    }

    #[test]
    fn test_forbidden_bit_rejected() {
        let mut depacketizer = Depacketizer::new();
        let mut out = Vec::new();
        assert!(depacketizer
            .push(&Bytes::from_static(&[0xe5, 0x00]), 1, &mut out)
            .is_err());
        assert!(out.is_empty());
    }
}
