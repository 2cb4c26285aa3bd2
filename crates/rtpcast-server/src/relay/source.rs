//! Broadcast source
//!
//! Routes every ingest payload to all sinks attached for its track kind.
//! Uses one sink per viewer track; a write that fails for one viewer is
//! dropped for that viewer only.

use async_trait::async_trait;
use futures_util::future::join_all;
use rtpcast_media::NalSample;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;
use webrtc::rtp::packet::Packet;

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of media written by the ingest pump
#[derive(Debug, Clone)]
pub enum MediaPayload {
    /// RTP packet forwarded as received
    Rtp(Packet),
    /// Reassembled H.264 access unit
    Sample(NalSample),
}

/// Per-viewer delivery endpoint for one track
#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn write(&self, payload: &MediaPayload) -> anyhow::Result<()>;
}

type SinkMap = HashMap<TrackKind, HashMap<Uuid, Arc<dyn MediaSink>>>;

pub struct BroadcastSource {
    kinds: Vec<TrackKind>,
    sinks: RwLock<SinkMap>,
    payloads_written: AtomicU64,
}

impl BroadcastSource {
    /// Create the source together with its single writer
    pub fn new(kinds: Vec<TrackKind>) -> (Arc<Self>, BroadcastWriter) {
        let source = Arc::new(Self {
            kinds,
            sinks: RwLock::new(HashMap::new()),
            payloads_written: AtomicU64::new(0),
        });
        let writer = BroadcastWriter {
            source: source.clone(),
        };
        (source, writer)
    }

    /// Track kinds every viewer gets attached
    pub fn kinds(&self) -> &[TrackKind] {
        &self.kinds
    }

    pub async fn attach(&self, session_id: Uuid, kind: TrackKind, sink: Arc<dyn MediaSink>) {
        self.sinks
            .write()
            .await
            .entry(kind)
            .or_default()
            .insert(session_id, sink);

        tracing::debug!("Attached {} sink for session {}", kind, session_id);
    }

    /// Remove every sink of a session, returns how many were attached
    pub async fn detach(&self, session_id: Uuid) -> usize {
        let mut sinks = self.sinks.write().await;
        let removed = sinks
            .values_mut()
            .filter_map(|by_session| by_session.remove(&session_id))
            .count();

        if removed > 0 {
            tracing::debug!("Detached {} sinks for session {}", removed, session_id);
        }

        removed
    }

    pub async fn subscriber_count(&self, kind: TrackKind) -> usize {
        self.sinks
            .read()
            .await
            .get(&kind)
            .map(|by_session| by_session.len())
            .unwrap_or(0)
    }

    pub fn payloads_written(&self) -> u64 {
        self.payloads_written.load(Ordering::Relaxed)
    }

    async fn fan_out(&self, kind: TrackKind, payload: &MediaPayload) -> usize {
        // Snapshot so attach/detach never wait on a slow viewer
        let targets: Vec<(Uuid, Arc<dyn MediaSink>)> = match self.sinks.read().await.get(&kind) {
            Some(by_session) => by_session
                .iter()
                .map(|(id, sink)| (*id, sink.clone()))
                .collect(),
            None => return 0,
        };

        let count = self.payloads_written.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 1000 == 1 {
            tracing::debug!("Writing {} payload {} to {} viewers", kind, count, targets.len());
        }

        let results = join_all(targets.iter().map(|(_, sink)| sink.write(payload))).await;

        let mut delivered = 0;
        for ((session_id, _), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => tracing::debug!("Dropped {} payload for session {}: {}", kind, session_id, e),
            }
        }
        delivered
    }
}

/// The only handle able to write into a [`BroadcastSource`]
pub struct BroadcastWriter {
    source: Arc<BroadcastSource>,
}

impl BroadcastWriter {
    /// Deliver a payload to every viewer attached for `kind`.
    ///
    /// Returns the number of viewers the payload reached.
    pub async fn write(&mut self, kind: TrackKind, payload: MediaPayload) -> usize {
        self.source.fan_out(kind, &payload).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;

    /// Records every payload written to it
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub payloads: Mutex<Vec<MediaPayload>>,
        pub fail: bool,
    }

    impl RecordingSink {
        pub fn len(&self) -> usize {
            self.payloads.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MediaSink for RecordingSink {
        async fn write(&self, payload: &MediaPayload) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("send buffer full");
            }
            self.payloads.lock().unwrap().push(payload.clone());
            Ok(())
        }
    }

    fn rtp(seq: u16) -> MediaPayload {
        let mut packet = Packet::default();
        packet.header.sequence_number = seq;
        packet.payload = Bytes::from_static(&[0x41, 0x00]);
        MediaPayload::Rtp(packet)
    }

    #[tokio::test]
    async fn test_write_reaches_every_sink_of_kind() {
        let (source, mut writer) = BroadcastSource::new(vec![TrackKind::Video, TrackKind::Audio]);
        let video_a = Arc::new(RecordingSink::default());
        let video_b = Arc::new(RecordingSink::default());
        let audio = Arc::new(RecordingSink::default());
        source.attach(Uuid::new_v4(), TrackKind::Video, video_a.clone()).await;
        source.attach(Uuid::new_v4(), TrackKind::Video, video_b.clone()).await;
        source.attach(Uuid::new_v4(), TrackKind::Audio, audio.clone()).await;

        assert_eq!(writer.write(TrackKind::Video, rtp(1)).await, 2);
        assert_eq!(video_a.len(), 1);
        assert_eq!(video_b.len(), 1);
        assert_eq!(audio.len(), 0);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_affect_others() {
        let (source, mut writer) = BroadcastSource::new(vec![TrackKind::Video]);
        let healthy = Arc::new(RecordingSink::default());
        let degraded = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        source.attach(Uuid::new_v4(), TrackKind::Video, healthy.clone()).await;
        source.attach(Uuid::new_v4(), TrackKind::Video, degraded).await;

        assert_eq!(writer.write(TrackKind::Video, rtp(1)).await, 1);
        assert_eq!(healthy.len(), 1);
    }

    #[tokio::test]
    async fn test_detach_stops_delivery() {
        let (source, mut writer) = BroadcastSource::new(vec![TrackKind::Video]);
        let sink = Arc::new(RecordingSink::default());
        let session_id = Uuid::new_v4();
        source.attach(session_id, TrackKind::Video, sink.clone()).await;

        writer.write(TrackKind::Video, rtp(1)).await;
        assert_eq!(source.detach(session_id).await, 1);
        assert_eq!(source.detach(session_id).await, 0);
        writer.write(TrackKind::Video, rtp(2)).await;

        assert_eq!(sink.len(), 1);
        assert_eq!(source.subscriber_count(TrackKind::Video).await, 0);
    }

    #[tokio::test]
    async fn test_write_without_viewers_is_dropped() {
        let (source, mut writer) = BroadcastSource::new(vec![TrackKind::Video]);
        assert_eq!(writer.write(TrackKind::Video, rtp(1)).await, 0);
        assert_eq!(source.payloads_written(), 0);
    }
}
