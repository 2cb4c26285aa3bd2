//! webrtc-rs implementation of the transport capabilities
//!
//! One shared `API` (media engine, interceptors, setting engine) creates a
//! peer connection per viewer. Peer connection callbacks are turned into
//! [`TransportEvent`]s and queued for the viewer's signaling task.

use crate::relay::{MediaPayload, MediaSink, TrackKind};
use crate::signaling::{
    TransportEvent, TransportEvents, TransportFactory, TransportSession, TransportState,
};
use crate::state::Config;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

const STREAM_ID: &str = "rtpcast";

// Profile Level ID: constrained baseline, level 3.1
// packetization-mode=1 enables FU-A / STAP-A
const H264_FMTP: &str = "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";

fn codec_capability(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/H264".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: H264_FMTP.to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
    }
}

fn map_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

/// Creates one peer connection per viewer from a shared API
pub struct RtcTransportFactory {
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    /// Reassembled video is written as samples instead of RTP
    reassemble: bool,
}

impl RtcTransportFactory {
    pub fn new(config: &Config) -> Result<Self> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(TrackKind::Video),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: codec_capability(TrackKind::Audio),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some(nat_ip) = &config.options.nat_ip {
            tracing::info!("Advertising {} as 1:1 NAT host address", nat_ip);
            setting_engine.set_nat_1to1_ips(vec![nat_ip.clone()], RTCIceCandidateType::Host);
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            reassemble: config.options.reassemble,
        })
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn TransportSession>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .context("Failed to create peer connection")?,
        );

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(TransportEvent::LocalCandidate(init));
                    }
                    Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        peer_connection.on_peer_connection_state_change(Box::new(move |state| {
            let _ = events.send(TransportEvent::StateChanged(map_state(state)));
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcTransport {
            peer_connection,
            reassemble: self.reassemble,
        }))
    }
}

pub struct RtcTransport {
    peer_connection: Arc<RTCPeerConnection>,
    reassemble: bool,
}

#[async_trait]
impl TransportSession for RtcTransport {
    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        Ok(self.peer_connection.create_offer(None).await?)
    }

    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<()> {
        Ok(self.peer_connection.set_local_description(description).await?)
    }

    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        Ok(self.peer_connection.set_remote_description(description).await?)
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        Ok(self.peer_connection.add_ice_candidate(candidate).await?)
    }

    async fn attach_outbound_track(&self, kind: TrackKind) -> Result<Arc<dyn MediaSink>> {
        let capability = codec_capability(kind);
        let track_id = kind.as_str().to_string();

        let (track, sink): (Arc<dyn TrackLocal + Send + Sync>, Arc<dyn MediaSink>) =
            if kind == TrackKind::Video && self.reassemble {
                let track = Arc::new(TrackLocalStaticSample::new(
                    capability,
                    track_id,
                    STREAM_ID.to_string(),
                ));
                (
                    track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                    Arc::new(RtcMediaSink::Sample(track)) as Arc<dyn MediaSink>,
                )
            } else {
                let track = Arc::new(TrackLocalStaticRTP::new(
                    capability,
                    track_id,
                    STREAM_ID.to_string(),
                ));
                (
                    track.clone() as Arc<dyn TrackLocal + Send + Sync>,
                    Arc::new(RtcMediaSink::Rtp(track)) as Arc<dyn MediaSink>,
                )
            };

        let transceiver = self
            .peer_connection
            .add_transceiver_from_track(
                track,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .with_context(|| format!("Failed to add {} transceiver", kind))?;

        // RTCP has to be read for interceptors such as NACK to run
        let sender = transceiver.sender().await;
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
            tracing::debug!("RTCP drain for {} track finished", kind);
        });

        Ok(sink)
    }

    fn state(&self) -> TransportState {
        map_state(self.peer_connection.connection_state())
    }

    async fn close(&self) -> Result<()> {
        Ok(self.peer_connection.close().await?)
    }
}

/// Local track of one viewer
pub enum RtcMediaSink {
    Rtp(Arc<TrackLocalStaticRTP>),
    Sample(Arc<TrackLocalStaticSample>),
}

#[async_trait]
impl MediaSink for RtcMediaSink {
    async fn write(&self, payload: &MediaPayload) -> Result<()> {
        match (self, payload) {
            (RtcMediaSink::Rtp(track), MediaPayload::Rtp(packet)) => {
                track.write_rtp(packet).await?;
            }
            (RtcMediaSink::Sample(track), MediaPayload::Sample(sample)) => {
                track
                    .write_sample(&Sample {
                        data: sample.data.clone(),
                        duration: sample.duration,
                        ..Default::default()
                    })
                    .await?;
            }
            (RtcMediaSink::Rtp(_), MediaPayload::Sample(_)) => {
                anyhow::bail!("RTP track cannot carry reassembled samples")
            }
            (RtcMediaSink::Sample(_), MediaPayload::Rtp(_)) => {
                anyhow::bail!("Sample track cannot carry raw RTP")
            }
        }
        Ok(())
    }
}
