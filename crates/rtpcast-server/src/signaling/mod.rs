//! Per-viewer signaling
//!
//! Each viewer connection is driven by one task through
//! `Connecting -> Negotiating -> Connected -> Closed`:
//! - on connect a transport session is created, the broadcast tracks are
//!   attached send-only and the session is registered
//! - an offer is sent immediately, exactly once
//! - `answer` and `candidate` frames from the viewer are applied in any order;
//!   candidates that arrive before the answer are held until it is applied
//! - local candidates from the transport are trickled back as `candidate`
//! - transport `Failed` closes the transport, `Closed` ends the session
//!
//! Outbound frames (offer, candidates, hub notices, pings) go through one
//! queue drained by a dedicated writer task, the only writer of the channel.
//! Every write is bounded by `Keepalive::write_wait` and a failed or late
//! write ends the session. A viewer that sends nothing, not even a pong, for
//! `Keepalive::pong_wait` is dropped. Teardown always closes the transport
//! before deregistering and runs exactly once.

mod transport;

pub use transport::{
    FrameReader, FrameWriter, Inbound, MessageChannel, TransportEvent, TransportEvents,
    TransportFactory, TransportSession, TransportState,
};

use crate::error::{ChannelError, Result, SignalError};
use crate::relay::{BroadcastSource, SessionRegistry, SessionState, ViewerSession};
use crate::ws::hub::HubHandle;
use rtpcast_protocol::{Event, SignalMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Candidates held while waiting for the answer
pub const MAX_PENDING_CANDIDATES: usize = 64;

/// Liveness and write deadlines of a viewer's message channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Interval between pings sent to the viewer
    pub ping_period: Duration,
    /// Longest silence tolerated from the viewer
    pub pong_wait: Duration,
    /// Longest a single frame write may take
    pub write_wait: Duration,
}

impl Default for Keepalive {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(60),
            pong_wait: Duration::from_secs(120),
            write_wait: Duration::from_secs(10),
        }
    }
}

/// Shared collaborators every viewer session needs
#[derive(Clone)]
pub struct SignalingContext {
    pub transports: Arc<dyn TransportFactory>,
    pub source: Arc<BroadcastSource>,
    pub registry: Arc<SessionRegistry>,
    pub hub: HubHandle,
    pub keepalive: Keepalive,
}

/// Drive one viewer from connect to teardown.
///
/// Returns the error that ended the session, if any. The session is fully
/// cleaned up either way.
pub async fn run_session<C: MessageChannel>(ctx: SignalingContext, channel: C) -> Result<()> {
    let (mut writer, reader) = channel.split();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = match ctx.transports.create(events_tx).await {
        Ok(transport) => transport,
        Err(e) => {
            writer.close().await;
            return Err(e.into());
        }
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session = Arc::new(ViewerSession::new(Uuid::new_v4(), transport, outbound_tx));
    let id = session.id();
    tracing::info!("Viewer {} connected", id);

    let (failures_tx, failures_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let writer_task = tokio::spawn(write_frames(
        writer,
        outbound_rx,
        shutdown_rx,
        failures_tx,
        ctx.keepalive,
    ));

    let mut driver = SessionDriver {
        ctx,
        session,
        reader,
        events: events_rx,
        write_failures: failures_rx,
        remote_description_set: false,
        pending_candidates: Vec::new(),
    };

    let result = driver.run().await;
    if let Err(e) = &result {
        tracing::warn!("Viewer {} session failed: {}", id, e);
    }
    driver.teardown().await;

    // The writer closes the channel on its way out
    let _ = shutdown_tx.send(());
    if let Err(e) = writer_task.await {
        tracing::warn!("Writer task for viewer {} failed: {}", id, e);
    }
    result
}

/// Sole writer of a viewer's message channel.
///
/// Drains the session's outbound queue and pings on `ping_period`. The first
/// failed or late write is reported on `failures` and stops the writer.
async fn write_frames<W: FrameWriter>(
    mut writer: W,
    mut frames: mpsc::UnboundedReceiver<String>,
    mut shutdown: oneshot::Receiver<()>,
    failures: mpsc::Sender<ChannelError>,
    keepalive: Keepalive,
) {
    let mut ping = time::interval_at(Instant::now() + keepalive.ping_period, keepalive.ping_period);

    let result = loop {
        let written = tokio::select! {
            _ = &mut shutdown => break Ok(()),
            frame = frames.recv() => match frame {
                Some(frame) => time::timeout(keepalive.write_wait, writer.send(frame)).await,
                None => break Ok(()),
            },
            _ = ping.tick() => time::timeout(keepalive.write_wait, writer.ping()).await,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err(ChannelError::WriteTimeout(keepalive.write_wait)),
        }
    };

    if let Err(e) = result {
        let _ = failures.try_send(e);
    }
    if time::timeout(keepalive.write_wait, writer.close()).await.is_err() {
        tracing::debug!("Close frame not written within {:?}", keepalive.write_wait);
    }
}

enum Flow {
    Continue,
    Stop,
}

struct SessionDriver<R> {
    ctx: SignalingContext,
    session: Arc<ViewerSession>,
    reader: R,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    write_failures: mpsc::Receiver<ChannelError>,
    remote_description_set: bool,
    pending_candidates: Vec<RTCIceCandidateInit>,
}

impl<R: FrameReader> SessionDriver<R> {
    async fn run(&mut self) -> Result<()> {
        self.attach_tracks().await?;
        self.ctx.registry.add(&self.session).await;

        // Queued ahead of registration so the offer is always the first frame
        self.send_offer().await?;
        self.ctx
            .hub
            .register(self.session.id(), self.session.outbound_sender())
            .await?;

        let pong_wait = self.ctx.keepalive.pong_wait;
        let mut read_deadline = Instant::now() + pong_wait;

        loop {
            tokio::select! {
                inbound = self.reader.receive() => {
                    read_deadline = Instant::now() + pong_wait;
                    match inbound {
                        Some(Ok(Inbound::Text(frame))) => self.handle_frame(&frame).await?,
                        Some(Ok(Inbound::Pong)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Viewer {} closed its message channel", self.session.id());
                            return Ok(());
                        }
                    }
                }
                Some(event) = self.events.recv() => {
                    if let Flow::Stop = self.handle_transport_event(event).await? {
                        return Ok(());
                    }
                }
                Some(e) = self.write_failures.recv() => return Err(e.into()),
                _ = time::sleep_until(read_deadline) => {
                    return Err(SignalError::KeepaliveExpired(pong_wait));
                }
            }
        }
    }

    async fn attach_tracks(&mut self) -> Result<()> {
        let transport = self.session.transport().clone();
        for &kind in self.ctx.source.kinds() {
            let sink = transport.attach_outbound_track(kind).await?;
            self.ctx.source.attach(self.session.id(), kind, sink).await;
        }
        Ok(())
    }

    /// Hand a frame to the writer task
    fn queue(&self, message: &SignalMessage) -> Result<()> {
        if self.session.send(message) {
            Ok(())
        } else {
            Err(ChannelError::Closed.into())
        }
    }

    async fn send_offer(&mut self) -> Result<()> {
        let transport = self.session.transport().clone();
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;

        self.queue(&SignalMessage::with_payload(Event::Offer, &offer)?)?;
        self.session.set_state(SessionState::Negotiating);

        tracing::debug!("Sent offer to viewer {}", self.session.id());
        Ok(())
    }

    async fn handle_frame(&mut self, frame: &str) -> Result<()> {
        let message = SignalMessage::decode(frame)?;
        let transport = self.session.transport().clone();

        match message.event {
            Event::Answer => {
                let answer: RTCSessionDescription = message.payload()?;
                transport.set_remote_description(answer).await?;
                self.remote_description_set = true;

                let pending = std::mem::take(&mut self.pending_candidates);
                if !pending.is_empty() {
                    tracing::debug!(
                        "Applying {} buffered candidates for viewer {}",
                        pending.len(),
                        self.session.id()
                    );
                }
                for candidate in pending {
                    transport.add_remote_candidate(candidate).await?;
                }
            }
            Event::Candidate => {
                let candidate: RTCIceCandidateInit = message.payload()?;
                if self.remote_description_set {
                    transport.add_remote_candidate(candidate).await?;
                } else if self.pending_candidates.len() >= MAX_PENDING_CANDIDATES {
                    return Err(SignalError::TooManyCandidates(MAX_PENDING_CANDIDATES));
                } else {
                    self.pending_candidates.push(candidate);
                }
            }
            other => return Err(SignalError::UnexpectedEvent(other)),
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<Flow> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.queue(&SignalMessage::with_payload(Event::Candidate, &candidate)?)?;
                Ok(Flow::Continue)
            }
            TransportEvent::StateChanged(state) => {
                tracing::info!("Viewer {} transport state: {:?}", self.session.id(), state);
                match state {
                    TransportState::Connected => {
                        self.session.set_state(SessionState::Connected);
                        Ok(Flow::Continue)
                    }
                    TransportState::Failed => {
                        if let Err(e) = self.session.transport().close().await {
                            tracing::warn!("Error closing failed transport: {}", e);
                        }
                        Ok(Flow::Stop)
                    }
                    TransportState::Closed => Ok(Flow::Stop),
                    _ => Ok(Flow::Continue),
                }
            }
        }
    }

    async fn teardown(&mut self) {
        if !self.session.begin_teardown() {
            return;
        }
        let id = self.session.id();
        self.session.set_state(SessionState::Closed);

        if let Err(e) = self.session.transport().close().await {
            tracing::warn!("Error closing transport for viewer {}: {}", id, e);
        }
        self.ctx.source.detach(id).await;

        self.ctx.registry.remove(id).await;
        self.ctx.registry.remove_closed().await;

        // Unregister first so the departing viewer is not counted or notified
        let _ = self.ctx.hub.unregister(id).await;
        let count = self.ctx.registry.count().await;
        if self
            .ctx
            .hub
            .broadcast(&SignalMessage::connections(count))
            .await
            .is_err()
        {
            tracing::debug!("Hub stopped, viewer count not broadcast");
        }

        tracing::info!("Viewer {} session closed ({} connections)", id, count);
    }
}
