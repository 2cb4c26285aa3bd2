use crate::relay::{BroadcastSource, SessionRegistry, TrackKind};
use crate::signaling::{Keepalive, SignalingContext, TransportFactory};
use crate::ws::hub::HubHandle;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

const DEFAULT_INGEST_PORT: u16 = 65535;

/// Variants of the relay that share one code path
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RelayOptions {
    /// Rebuild H.264 access units instead of forwarding RTP as received
    pub reassemble: bool,
    /// Serve a separate audio track fed by its own payload type
    pub dual_track: bool,
    /// Public address advertised as a 1:1 NAT host candidate
    pub nat_ip: Option<String>,
}

impl RelayOptions {
    pub fn track_kinds(&self) -> Vec<TrackKind> {
        if self.dual_track {
            vec![TrackKind::Video, TrackKind::Audio]
        } else {
            vec![TrackKind::Video]
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    pub ingest_address: IpAddr,
    pub ingest_port: u16,
    pub video_payload_type: u8,
    pub audio_payload_type: u8,
    pub stun_servers: Vec<String>,
    pub options: RelayOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "localhost:8080".to_string(),
            ingest_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ingest_port: DEFAULT_INGEST_PORT,
            video_payload_type: 96,
            audio_payload_type: 97,
            stun_servers: vec![],
            options: RelayOptions::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let bind_address = std::env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let ingest_address = match std::env::var("INGEST_ADDRESS") {
            Ok(addr) => addr.parse()?,
            Err(_) => defaults.ingest_address,
        };

        let ingest_port = std::env::var("INGEST_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or_else(|| {
                tracing::debug!("INGEST_PORT not set or invalid, using {}", DEFAULT_INGEST_PORT);
                DEFAULT_INGEST_PORT
            });

        let video_payload_type = env_parse("VIDEO_PAYLOAD_TYPE", defaults.video_payload_type);
        let audio_payload_type = env_parse("AUDIO_PAYLOAD_TYPE", defaults.audio_payload_type);

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let options = RelayOptions {
            reassemble: env_flag("REASSEMBLE"),
            dual_track: env_flag("DUAL_TRACK"),
            nat_ip: std::env::var("NAT_IP").ok().filter(|ip| !ip.is_empty()),
        };

        Ok(Config {
            bind_address,
            ingest_address,
            ingest_port,
            video_payload_type,
            audio_payload_type,
            stun_servers,
            options,
        })
    }

    pub fn ingest_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ingest_address, self.ingest_port)
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub source: Arc<BroadcastSource>,
    pub registry: Arc<SessionRegistry>,
    pub hub: HubHandle,
    pub transports: Arc<dyn TransportFactory>,
}

impl AppState {
    pub fn signaling(&self) -> SignalingContext {
        SignalingContext {
            transports: self.transports.clone(),
            source: self.source.clone(),
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            keepalive: Keepalive::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_kinds_follow_dual_track() {
        let single = RelayOptions::default();
        assert_eq!(single.track_kinds(), vec![TrackKind::Video]);

        let dual = RelayOptions {
            dual_track: true,
            ..Default::default()
        };
        assert_eq!(dual.track_kinds(), vec![TrackKind::Video, TrackKind::Audio]);
    }

    #[test]
    fn test_default_ingest_address() {
        let config = Config::default();
        assert_eq!(config.ingest_socket_addr().to_string(), "127.0.0.1:65535");
    }
}
