//! H.264 access unit reassembly
//!
//! Packets are grouped by RTP timestamp into access units. An access unit is
//! complete when the marker bit is seen or when a packet with a new timestamp
//! arrives. Each completed access unit is rewritten so that it can be decoded
//! by a viewer that joins mid-stream:
//! - SPS and PPS units are held back in the parameter-set cache, which keeps
//!   only the most recent unit of each type
//! - the next IDR slice is emitted with the cache prepended, which empties it
//! - all other units pass through with a start code prefix

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use webrtc::rtp::packet::Packet;

use crate::error::{MediaError, Result};
use crate::h264::{Depacketizer, NalUnit, NalUnitType, START_CODE};

/// H.264 RTP clock rate
pub const H264_CLOCK_RATE: u32 = 90_000;

/// Upper bound for one buffered access unit
pub const MAX_ACCESS_UNIT_BYTES: usize = 8 * 1024 * 1024;

/// Used when the spacing between two access units cannot be measured
const DEFAULT_FRAME_DURATION: Duration = Duration::from_nanos(1_000_000_000 / 30);

/// A rewritten access unit in Annex B format, ready for packetization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalSample {
    pub data: Bytes,
    pub rtp_timestamp: u32,
    pub duration: Duration,
}

pub struct NalReassembler {
    depacketizer: Depacketizer,
    /// Timestamp of the access unit being assembled
    current_timestamp: Option<u32>,
    pending: Vec<NalUnit>,
    pending_bytes: usize,
    /// Start-code prefixed SPS seen since the last IDR
    sps: Option<Bytes>,
    /// Start-code prefixed PPS seen since the last IDR
    pps: Option<Bytes>,
    ready: VecDeque<NalSample>,
    last_emitted_timestamp: Option<u32>,
}

impl NalReassembler {
    pub fn new() -> Self {
        Self {
            depacketizer: Depacketizer::new(),
            current_timestamp: None,
            pending: Vec::new(),
            pending_bytes: 0,
            sps: None,
            pps: None,
            ready: VecDeque::new(),
            last_emitted_timestamp: None,
        }
    }

    /// Feed one RTP packet.
    ///
    /// A malformed payload is rejected without disturbing units already
    /// buffered for the current access unit.
    pub fn push(&mut self, packet: &Packet) -> Result<()> {
        let timestamp = packet.header.timestamp;
        if self.current_timestamp.is_some_and(|current| current != timestamp) {
            self.depacketizer.reset();
            self.finish_access_unit();
        }
        self.current_timestamp = Some(timestamp);

        let mut units = Vec::new();
        let result = self
            .depacketizer
            .push(&packet.payload, packet.header.sequence_number, &mut units);

        for unit in units {
            self.pending_bytes += unit.data.len() + START_CODE.len();
            self.pending.push(unit);
        }

        if self.pending_bytes > MAX_ACCESS_UNIT_BYTES {
            self.pending.clear();
            self.pending_bytes = 0;
            self.depacketizer.reset();
            return Err(MediaError::AccessUnitTooLarge(MAX_ACCESS_UNIT_BYTES));
        }

        if packet.header.marker {
            self.finish_access_unit();
        }

        result
    }

    /// Next completed sample, if any
    pub fn pop(&mut self) -> Option<NalSample> {
        self.ready.pop_front()
    }

    /// Cached parameter sets, SPS first
    pub fn parameter_sets(&self) -> Bytes {
        let mut out = BytesMut::new();
        for set in self.sps.iter().chain(self.pps.iter()) {
            out.extend_from_slice(set);
        }
        out.freeze()
    }

    fn finish_access_unit(&mut self) {
        let Some(timestamp) = self.current_timestamp.take() else {
            return;
        };
        self.pending_bytes = 0;

        let mut out = BytesMut::new();
        for unit in std::mem::take(&mut self.pending) {
            self.rewrite(unit, &mut out);
        }

        if out.is_empty() {
            return;
        }

        let duration = self.duration_since_last(timestamp);
        self.last_emitted_timestamp = Some(timestamp);
        self.ready.push_back(NalSample {
            data: out.freeze(),
            rtp_timestamp: timestamp,
            duration,
        });
    }

    fn rewrite(&mut self, unit: NalUnit, out: &mut BytesMut) {
        match unit.unit_type {
            unit_type if unit_type.is_parameter_set() => {
                let mut prefixed = BytesMut::with_capacity(START_CODE.len() + unit.data.len());
                unit.write_annex_b(&mut prefixed);
                let slot = if unit_type == NalUnitType::Sps {
                    &mut self.sps
                } else {
                    &mut self.pps
                };
                *slot = Some(prefixed.freeze());
            }
            NalUnitType::CodedSliceIdr => {
                if self.sps.is_none() && self.pps.is_none() {
                    tracing::debug!("IDR without cached parameter sets, emitting as-is");
                }
                for set in [self.sps.take(), self.pps.take()].into_iter().flatten() {
                    out.extend_from_slice(&set);
                }
                unit.write_annex_b(out);
            }
            _ => unit.write_annex_b(out),
        }
    }

    fn duration_since_last(&self, timestamp: u32) -> Duration {
        let Some(last) = self.last_emitted_timestamp else {
            return DEFAULT_FRAME_DURATION;
        };
        let ticks = timestamp.wrapping_sub(last);
        if ticks == 0 || ticks > H264_CLOCK_RATE {
            return DEFAULT_FRAME_DURATION;
        }
        Duration::from_micros(ticks as u64 * 1_000_000 / H264_CLOCK_RATE as u64)
    }
}

impl Default for NalReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::rtp::header::Header;

    const SPS: &[u8] = &[0x67, 0x42, 0xc0, 0x1f];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];
    const IDR: &[u8] = &[0x65, 0x88, 0x84, 0x00];
    const SLICE: &[u8] = &[0x41, 0x9a, 0x02, 0x00];

    fn packet(payload: &[u8], seq: u16, timestamp: u32, marker: bool) -> Packet {
        Packet {
            header: Header {
                version: 2,
                payload_type: 96,
                sequence_number: seq,
                timestamp,
                marker,
                ..Default::default()
            },
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn annex_b(units: &[&[u8]]) -> Vec<u8> {
        units
            .iter()
            .flat_map(|unit| START_CODE.iter().chain(unit.iter()).copied())
            .collect()
    }

    #[test]
    fn test_idr_carries_cached_parameter_sets() {
        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(SPS, 1, 3000, false)).unwrap();
        reassembler.push(&packet(PPS, 2, 3000, false)).unwrap();
        reassembler.push(&packet(IDR, 3, 3000, true)).unwrap();

        let sample = reassembler.pop().expect("IDR sample");
        assert_eq!(&sample.data[..], &annex_b(&[SPS, PPS, IDR])[..]);
        assert!(reassembler.parameter_sets().is_empty());
        assert!(reassembler.pop().is_none());
    }

    #[test]
    fn test_parameter_sets_in_own_access_unit_are_held_back() {
        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(SPS, 1, 1000, true)).unwrap();
        reassembler.push(&packet(PPS, 2, 2000, true)).unwrap();
        assert!(reassembler.pop().is_none());
        assert_eq!(&reassembler.parameter_sets()[..], &annex_b(&[SPS, PPS])[..]);

        reassembler.push(&packet(IDR, 3, 3000, true)).unwrap();
        let sample = reassembler.pop().unwrap();
        assert_eq!(&sample.data[..], &annex_b(&[SPS, PPS, IDR])[..]);
        assert!(reassembler.parameter_sets().is_empty());
    }

    #[test]
    fn test_stap_a_parameter_sets() {
        let mut stap = vec![0x18];
        for unit in [SPS, PPS] {
            stap.extend_from_slice(&(unit.len() as u16).to_be_bytes());
            stap.extend_from_slice(unit);
        }
        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(&stap, 1, 3000, false)).unwrap();
        reassembler.push(&packet(IDR, 2, 3000, true)).unwrap();

        assert_eq!(
            &reassembler.pop().unwrap().data[..],
            &annex_b(&[SPS, PPS, IDR])[..]
        );
    }

    #[test]
    fn test_non_parameter_units_pass_through() {
        let mut reassembler = NalReassembler::new();
        let sei: &[u8] = &[0x06, 0x05, 0x01];
        reassembler.push(&packet(SLICE, 1, 3000, true)).unwrap();
        reassembler.push(&packet(sei, 2, 6000, true)).unwrap();

        assert_eq!(&reassembler.pop().unwrap().data[..], &annex_b(&[SLICE])[..]);
        assert_eq!(&reassembler.pop().unwrap().data[..], &annex_b(&[sei])[..]);
        assert!(reassembler.parameter_sets().is_empty());
    }

    #[test]
    fn test_idr_without_parameter_sets_emitted_as_is() {
        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(IDR, 1, 3000, true)).unwrap();
        assert_eq!(&reassembler.pop().unwrap().data[..], &annex_b(&[IDR])[..]);
    }

    #[test]
    fn test_timestamp_change_completes_access_unit() {
        let mut reassembler = NalReassembler::new();
        // Marker lost on the first frame
        reassembler.push(&packet(SLICE, 1, 3000, false)).unwrap();
        assert!(reassembler.pop().is_none());
        reassembler.push(&packet(SLICE, 2, 6000, false)).unwrap();

        let first = reassembler.pop().unwrap();
        assert_eq!(first.rtp_timestamp, 3000);
        assert!(reassembler.pop().is_none());
    }

    #[test]
    fn test_duration_from_timestamp_spacing() {
        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(SLICE, 1, 0, true)).unwrap();
        reassembler.push(&packet(SLICE, 2, 3000, true)).unwrap();

        assert_eq!(reassembler.pop().unwrap().duration, DEFAULT_FRAME_DURATION);
        assert_eq!(
            reassembler.pop().unwrap().duration,
            Duration::from_micros(33_333)
        );
    }

    #[test]
    fn test_repeated_parameter_sets_cached_once() {
        let mut reassembler = NalReassembler::new();
        for seq in 0..5u16 {
            reassembler.push(&packet(SPS, seq, 1000 * seq as u32, true)).unwrap();
        }
        assert_eq!(&reassembler.parameter_sets()[..], &annex_b(&[SPS])[..]);
    }

    #[test]
    fn test_changed_parameter_sets_replace_cached_ones() {
        let new_sps: &[u8] = &[0x67, 0x64, 0x00, 0x28];
        let new_pps: &[u8] = &[0x68, 0xee, 0x3c, 0xb0];

        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(SPS, 1, 1000, false)).unwrap();
        reassembler.push(&packet(PPS, 2, 1000, true)).unwrap();
        reassembler.push(&packet(new_sps, 3, 2000, false)).unwrap();
        reassembler.push(&packet(new_pps, 4, 2000, true)).unwrap();
        assert_eq!(
            &reassembler.parameter_sets()[..],
            &annex_b(&[new_sps, new_pps])[..]
        );

        reassembler.push(&packet(IDR, 5, 3000, true)).unwrap();
        assert_eq!(
            &reassembler.pop().unwrap().data[..],
            &annex_b(&[new_sps, new_pps, IDR])[..]
        );
    }

    #[test]
    fn test_malformed_packet_keeps_buffered_units() {
        let mut reassembler = NalReassembler::new();
        reassembler.push(&packet(SLICE, 1, 3000, false)).unwrap();
        assert!(reassembler.push(&packet(&[], 2, 3000, false)).is_err());
        reassembler.push(&packet(SLICE, 3, 3000, true)).unwrap();

        assert_eq!(
            &reassembler.pop().unwrap().data[..],
            &annex_b(&[SLICE, SLICE])[..]
        );
    }
}
