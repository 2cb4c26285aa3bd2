//! UDP ingest pump
//!
//! Owns the ingest socket for the lifetime of the process. Every datagram is
//! one RTP packet; it is routed by payload type to a track kind and written
//! into the broadcast source, either as received or through the H.264
//! reassembler. Malformed packets are dropped and never stop the loop.

use crate::error::IngestError;
use crate::relay::{BroadcastWriter, MediaPayload, TrackKind};
use crate::state::Config;
use rtpcast_media::{parse_rtp, NalReassembler};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use webrtc::rtp::packet::Packet;

/// UDP MTU assumption for one ingest datagram
pub const MAX_DATAGRAM_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub reassemble: bool,
    pub dual_track: bool,
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
}

impl IngestOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            reassemble: config.options.reassemble,
            dual_track: config.options.dual_track,
            video_payload_type: config.video_payload_type,
            audio_payload_type: config.audio_payload_type,
        }
    }

    /// Track a payload type feeds; single-track mode sends everything to video
    pub fn route(&self, payload_type: u8) -> Option<TrackKind> {
        if !self.dual_track {
            return Some(TrackKind::Video);
        }
        if payload_type == self.video_payload_type {
            Some(TrackKind::Video)
        } else if payload_type == self.audio_payload_type {
            Some(TrackKind::Audio)
        } else {
            None
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub malformed: u64,
    pub unrouted: u64,
    pub written: u64,
}

pub struct IngestPump {
    socket: UdpSocket,
    writer: BroadcastWriter,
    options: IngestOptions,
    reassembler: NalReassembler,
    stats: IngestStats,
    ssrc: Option<u32>,
}

impl IngestPump {
    pub async fn bind(
        addr: SocketAddr,
        writer: BroadcastWriter,
        options: IngestOptions,
    ) -> Result<Self, IngestError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| IngestError::Bind { addr, source })?;

        tracing::info!(
            "Waiting for RTP packets on {} (reassemble={}, dual_track={})",
            socket.local_addr().unwrap_or(addr),
            options.reassemble,
            options.dual_track
        );

        Ok(Self {
            socket,
            writer,
            options,
            reassembler: NalReassembler::new(),
            stats: IngestStats::default(),
            ssrc: None,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Receive loop; only returns when the socket itself fails
    pub async fn run(mut self) -> Result<(), IngestError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (n, _) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(IngestError::Receive)?;
            self.handle_datagram(&buf[..n]).await;
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8]) {
        self.stats.received += 1;

        let packet = match parse_rtp(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.malformed += 1;
                if self.stats.malformed % 100 == 1 {
                    tracing::debug!(
                        "Dropping malformed ingest packet ({} so far): {}",
                        self.stats.malformed,
                        e
                    );
                }
                return;
            }
        };

        if self.ssrc.is_none() {
            tracing::info!(
                "First RTP packet received: ssrc={:#010x} payload_type={}",
                packet.header.ssrc,
                packet.header.payload_type
            );
            self.ssrc = Some(packet.header.ssrc);
        }

        let Some(kind) = self.options.route(packet.header.payload_type) else {
            self.stats.unrouted += 1;
            if self.stats.unrouted % 100 == 1 {
                tracing::debug!("No track for payload type {}", packet.header.payload_type);
            }
            return;
        };

        if kind == TrackKind::Video && self.options.reassemble {
            self.reassemble(packet).await;
        } else {
            self.writer.write(kind, MediaPayload::Rtp(packet)).await;
            self.stats.written += 1;
        }
    }

    async fn reassemble(&mut self, packet: Packet) {
        if let Err(e) = self.reassembler.push(&packet) {
            self.stats.malformed += 1;
            tracing::debug!("Dropping undecodable H.264 payload: {}", e);
        }
        while let Some(sample) = self.reassembler.pop() {
            self.writer
                .write(TrackKind::Video, MediaPayload::Sample(sample))
                .await;
            self.stats.written += 1;
        }
    }
}
