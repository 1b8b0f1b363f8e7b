//! Swarm session orchestration
//!
//! [`SwarmSession`] runs one complete signaling session:
//!
//! 1. load the content descriptor (info hash, total length)
//! 2. generate a peer id and open the tracker connection
//! 3. create `numwant` negotiation attempts and announce them as `started`
//! 4. dispatch inbound events until cancelled, a limit is hit or the tracker
//!    goes away
//! 5. send a `stopped` announce if the connection is still usable, abandon
//!    pending attempts and close the connection
//!
//! Tracker frames and peer connection callbacks arrive on a single
//! [`InboundEvent`] channel and are handled by one dispatcher loop, so the
//! negotiation tracker never sees two answers interleaved.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::codec::{CodecError, InfoHash, OfferId, PeerId};
use crate::metadata::{ContentDescriptor, MetadataError, MetadataLoader};
use crate::protocol::{decode_response, AnnounceEvent, AnnounceOffer, AnnounceRequest, TransferStats};
use crate::rendezvous::RendezvousSession;
use crate::tracker::{AttemptSummary, NegotiationTracker, SwarmStats, TrackerError, TrackerEvent};
use crate::transport::{
    ConnectionState, DataChannel, EventRx, EventTx, InboundEvent, PeerConnectionFactory,
    RelayTransport, TransportError, TransportEvent,
};
use crate::types::SwarmConfig;

/// Smallest period of the stale-attempt sweep
const MIN_EXPIRY_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("configuration error: {0}")]
    Configuration(#[from] MetadataError),
    #[error("tracker connection error: {0}")]
    Connection(TransportError),
    #[error("failed to send announce: {0}")]
    Send(TransportError),
    #[error("entropy source unavailable: {0}")]
    EntropySource(String),
    #[error("identifier error: {0}")]
    Identifier(CodecError),
    #[error("session already started")]
    AlreadyStarted,
}

impl From<CodecError> for SwarmError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::EntropySource(reason) => SwarmError::EntropySource(reason),
            other => SwarmError::Identifier(other),
        }
    }
}

/// Why the dispatcher loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    RelayClosed,
    MessageLimit,
    IdleTimeout,
    SessionTimeout,
}

impl SessionEnd {
    /// Whether the tracker connection can still carry a final announce
    pub fn relay_usable(self) -> bool {
        !matches!(self, SessionEnd::RelayClosed)
    }
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::Cancelled => write!(f, "cancelled"),
            SessionEnd::RelayClosed => write!(f, "tracker closed the connection"),
            SessionEnd::MessageLimit => write!(f, "message limit reached"),
            SessionEnd::IdleTimeout => write!(f, "idle timeout"),
            SessionEnd::SessionTimeout => write!(f, "session timeout"),
        }
    }
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub end: SessionEnd,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    /// Tracker messages processed, malformed ones included
    pub messages: usize,
    pub attempts: AttemptSummary,
}

/// Notifications for the embedding application
#[derive(Clone)]
pub enum SwarmEvent {
    Announced {
        event: AnnounceEvent,
        offers: Vec<OfferId>,
    },
    SwarmStats(SwarmStats),
    PeerConnected {
        offer_id: OfferId,
        peer_id: Option<String>,
        channel: Arc<dyn DataChannel>,
    },
    NegotiationFailed {
        offer_id: OfferId,
        cause: String,
    },
    ChannelOpen {
        offer_id: OfferId,
        label: String,
    },
    ChannelMessage {
        offer_id: OfferId,
        data: Vec<u8>,
    },
    TrackerWarning(String),
    TrackerFailure(String),
}

impl std::fmt::Debug for SwarmEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwarmEvent::Announced { event, offers } => f
                .debug_struct("Announced")
                .field("event", event)
                .field("offers", offers)
                .finish(),
            SwarmEvent::SwarmStats(stats) => f.debug_tuple("SwarmStats").field(stats).finish(),
            SwarmEvent::PeerConnected {
                offer_id, peer_id, ..
            } => f
                .debug_struct("PeerConnected")
                .field("offer_id", offer_id)
                .field("peer_id", peer_id)
                .finish_non_exhaustive(),
            SwarmEvent::NegotiationFailed { offer_id, cause } => f
                .debug_struct("NegotiationFailed")
                .field("offer_id", offer_id)
                .field("cause", cause)
                .finish(),
            SwarmEvent::ChannelOpen { offer_id, label } => f
                .debug_struct("ChannelOpen")
                .field("offer_id", offer_id)
                .field("label", label)
                .finish(),
            SwarmEvent::ChannelMessage { offer_id, data } => f
                .debug_struct("ChannelMessage")
                .field("offer_id", offer_id)
                .field("len", &data.len())
                .finish(),
            SwarmEvent::TrackerWarning(message) => {
                f.debug_tuple("TrackerWarning").field(message).finish()
            }
            SwarmEvent::TrackerFailure(reason) => {
                f.debug_tuple("TrackerFailure").field(reason).finish()
            }
        }
    }
}

impl From<TrackerEvent> for SwarmEvent {
    fn from(event: TrackerEvent) -> Self {
        match event {
            TrackerEvent::SwarmStats(stats) => SwarmEvent::SwarmStats(stats),
            TrackerEvent::PeerConnected {
                offer_id,
                peer_id,
                channel,
            } => SwarmEvent::PeerConnected {
                offer_id,
                peer_id,
                channel,
            },
            TrackerEvent::NegotiationFailed { offer_id, cause } => {
                SwarmEvent::NegotiationFailed { offer_id, cause }
            }
        }
    }
}

/// Identity and counters announced for the lifetime of a session
struct AnnounceContext {
    info_hash: InfoHash,
    peer_id: PeerId,
    stats: TransferStats,
}

/// One signaling session against one tracker
pub struct SwarmSession<R: RelayTransport + 'static, F: PeerConnectionFactory> {
    config: SwarmConfig,
    relay: Arc<R>,
    tracker: Arc<NegotiationTracker<F>>,
    events_tx: EventTx,
    events_rx: Option<EventRx>,
    sink: Option<mpsc::Sender<SwarmEvent>>,
    /// Set for the duration of a run
    cancel: Option<watch::Receiver<bool>>,
}

impl<R, F> SwarmSession<R, F>
where
    R: RelayTransport + 'static,
    F: PeerConnectionFactory + 'static,
{
    /// `events` must be the channel the factory publishes its callbacks on
    pub fn new(config: SwarmConfig, relay: Arc<R>, factory: Arc<F>, events: (EventTx, EventRx)) -> Self {
        let (events_tx, events_rx) = events;
        Self {
            config,
            relay,
            tracker: Arc::new(NegotiationTracker::new(factory)),
            events_tx,
            events_rx: Some(events_rx),
            sink: None,
            cancel: None,
        }
    }

    /// Receive [`SwarmEvent`]s while the session runs
    pub fn set_event_sink(&mut self, sink: mpsc::Sender<SwarmEvent>) {
        self.sink = Some(sink);
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn tracker(&self) -> Arc<NegotiationTracker<F>> {
        self.tracker.clone()
    }

    /// Load the descriptor at `path` and run the session
    pub async fn run(
        &mut self,
        loader: &dyn MetadataLoader,
        path: &Path,
        cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, SwarmError> {
        let descriptor = loader.load_content_descriptor(path)?;
        info!(
            "Loaded {} ({}, {} bytes)",
            path.display(),
            descriptor.name.as_deref().unwrap_or("unnamed"),
            descriptor.total_length
        );
        self.run_descriptor(descriptor, cancel).await
    }

    /// Run the session for an already loaded descriptor.
    /// A session runs at most once.
    pub async fn run_descriptor(
        &mut self,
        descriptor: ContentDescriptor,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionReport, SwarmError> {
        let mut events_rx = self.events_rx.take().ok_or(SwarmError::AlreadyStarted)?;
        self.cancel = Some(cancel.clone());

        let ctx = AnnounceContext {
            info_hash: descriptor.info_hash,
            peer_id: PeerId::generate()?,
            stats: TransferStats {
                left: descriptor.total_length,
                ..Default::default()
            },
        };
        info!(
            "Joining swarm {} as {} ({} bytes left)",
            ctx.info_hash,
            String::from_utf8_lossy(ctx.peer_id.as_bytes()),
            ctx.stats.left
        );

        if *cancel.borrow() {
            return Ok(self.report(SessionEnd::Cancelled, 0, &ctx).await);
        }

        let session = tokio::select! {
            opened = RendezvousSession::open(self.relay.clone(), &self.config.tracker_url) => {
                opened.map_err(|e| {
                    error!("Could not connect to tracker {}: {}", self.config.tracker_url, e);
                    SwarmError::Connection(e)
                })?
            }
            _ = wait_cancelled(&mut cancel) => {
                info!("Cancelled while connecting to tracker");
                self.relay.disconnect().await;
                return Ok(self.report(SessionEnd::Cancelled, 0, &ctx).await);
            }
        };

        let pump = session.spawn_pump(self.events_tx.clone());
        let outcome = self.dispatch(&session, &ctx, &mut events_rx, &mut cancel).await;
        pump.abort();

        if let Ok((end, _)) = &outcome {
            if self.config.announce_stopped && end.relay_usable() {
                self.announce_stopped(&session, &ctx).await;
            }
        }
        let abandoned = self.tracker.abandon_all().await;
        if !abandoned.is_empty() {
            info!("Abandoned {} pending attempt(s)", abandoned.len());
        }
        session.close().await;

        let (end, messages) = outcome?;
        let report = self.report(end, messages, &ctx).await;
        info!(
            "Session ended ({}) after {} message(s): {} connected, {} failed, {} abandoned",
            report.end,
            report.messages,
            report.attempts.connected,
            report.attempts.failed,
            report.attempts.abandoned
        );
        Ok(report)
    }

    /// Announce and run the dispatcher loop until a stop condition
    async fn dispatch(
        &self,
        session: &RendezvousSession<R>,
        ctx: &AnnounceContext,
        events_rx: &mut EventRx,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(SessionEnd, usize), SwarmError> {
        tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => {
                info!("Cancelled during initial announce");
                return Ok((SessionEnd::Cancelled, 0));
            }
            sent = self.announce(session, ctx, AnnounceEvent::Started) => sent?,
        }

        let session_deadline = self.config.session_timeout.map(|t| Instant::now() + t);
        let mut idle_deadline = self.config.idle_timeout.map(|t| Instant::now() + t);
        let mut next_announce: Option<Instant> = None;
        let mut expiry = self
            .config
            .attempt_timeout
            .map(|t| tokio::time::interval((t / 2).max(MIN_EXPIRY_PERIOD)));
        let mut messages = 0usize;

        let end = loop {
            if self.config.max_messages.map_or(false, |max| messages >= max) {
                info!("Processed {} tracker message(s), stopping", messages);
                break SessionEnd::MessageLimit;
            }
            tokio::select! {
                _ = wait_cancelled(cancel) => {
                    info!("Session cancelled");
                    break SessionEnd::Cancelled;
                }
                _ = sleep_until_opt(session_deadline) => {
                    info!("Session timeout reached");
                    break SessionEnd::SessionTimeout;
                }
                _ = sleep_until_opt(idle_deadline) => {
                    info!("No tracker message within idle timeout");
                    break SessionEnd::IdleTimeout;
                }
                _ = sleep_until_opt(next_announce) => {
                    next_announce = None;
                    tokio::select! {
                        biased;
                        _ = wait_cancelled(cancel) => {
                            info!("Session cancelled during announce");
                            break SessionEnd::Cancelled;
                        }
                        sent = self.announce(session, ctx, AnnounceEvent::Update) => sent?,
                    }
                }
                _ = tick_opt(&mut expiry) => {
                    if let Some(max_age) = self.config.attempt_timeout {
                        for event in self.tracker.expire_stale(max_age).await {
                            self.notify(event.into()).await;
                        }
                    }
                }
                event = events_rx.recv() => match event {
                    Some(InboundEvent::Relay(text)) => {
                        messages += 1;
                        if let Some(t) = self.config.idle_timeout {
                            idle_deadline = Some(Instant::now() + t);
                        }
                        if let Some(interval) = self.handle_frame(&text).await {
                            if self.config.reannounce && next_announce.is_none() {
                                next_announce = Some(Instant::now() + Duration::from_secs(interval));
                            }
                        }
                    }
                    Some(InboundEvent::RelayClosed) | None => {
                        warn!("Tracker closed the connection");
                        break SessionEnd::RelayClosed;
                    }
                    Some(InboundEvent::RelayError(e)) => {
                        error!("Tracker connection failed: {}", e);
                        return Err(SwarmError::Connection(e));
                    }
                    Some(InboundEvent::Transport(event)) => self.handle_transport_event(event).await,
                },
            }
        };

        Ok((end, messages))
    }

    /// Decode and apply one tracker frame. Returns the announce interval if present.
    async fn handle_frame(&self, text: &str) -> Option<u64> {
        let response = match decode_response(text) {
            Ok(response) => response,
            Err(e) => {
                warn!("Dropping tracker message: {}", e);
                return None;
            }
        };

        if let Some(reason) = &response.failure_reason {
            warn!("Tracker failure: {}", reason);
            self.notify(SwarmEvent::TrackerFailure(reason.clone())).await;
        }
        if let Some(message) = &response.warning_message {
            warn!("Tracker warning: {}", message);
            self.notify(SwarmEvent::TrackerWarning(message.clone())).await;
        }

        for event in self.tracker.handle_inbound(&response).await {
            if let TrackerEvent::SwarmStats(stats) = &event {
                debug!(
                    "Swarm stats: interval={:?} complete={:?} incomplete={:?}",
                    stats.interval, stats.complete, stats.incomplete
                );
            }
            self.notify(event.into()).await;
        }
        response.interval
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged { offer_id, state } => {
                debug!("Attempt {} connection state: {}", offer_id.short(), state);
                if state == ConnectionState::Failed {
                    if let Some(event) = self
                        .tracker
                        .fail_attempt(offer_id, "peer connection failed")
                        .await
                    {
                        self.notify(event.into()).await;
                    }
                }
            }
            TransportEvent::ChannelOpen { offer_id, label } => {
                info!("Data channel '{}' open for attempt {}", label, offer_id.short());
                self.notify(SwarmEvent::ChannelOpen { offer_id, label }).await;
            }
            TransportEvent::ChannelMessage { offer_id, data } => {
                debug!("Attempt {} received {} bytes", offer_id.short(), data.len());
                self.notify(SwarmEvent::ChannelMessage { offer_id, data }).await;
            }
            TransportEvent::ChannelClosed { offer_id } => {
                debug!("Data channel closed for attempt {}", offer_id.short());
            }
        }
    }

    /// Create fresh attempts and send them in one announce
    async fn announce(
        &self,
        session: &RendezvousSession<R>,
        ctx: &AnnounceContext,
        event: AnnounceEvent,
    ) -> Result<(), SwarmError> {
        let mut offers = Vec::with_capacity(self.config.numwant);
        for _ in 0..self.config.numwant {
            match self.tracker.create_attempt().await {
                Ok((offer_id, offer)) => offers.push(AnnounceOffer { offer_id, offer }),
                Err(TrackerError::Codec(e)) => return Err(e.into()),
                Err(e) => warn!("Skipping offer: {}", e),
            }
        }

        let offer_ids: Vec<OfferId> = offers.iter().map(|o| o.offer_id).collect();
        let request = AnnounceRequest::new(
            ctx.info_hash,
            ctx.peer_id,
            offers.len(),
            ctx.stats,
            event,
            offers,
        );
        session.send(&request).await.map_err(SwarmError::Send)?;
        info!("Announced '{}' with {} offer(s)", event, offer_ids.len());

        self.notify(SwarmEvent::Announced {
            event,
            offers: offer_ids,
        })
        .await;
        Ok(())
    }

    /// Best effort; the session is ending either way
    async fn announce_stopped(&self, session: &RendezvousSession<R>, ctx: &AnnounceContext) {
        let request = AnnounceRequest::new(
            ctx.info_hash,
            ctx.peer_id,
            0,
            ctx.stats,
            AnnounceEvent::Stopped,
            Vec::new(),
        );
        match session.send(&request).await {
            Ok(()) => info!("Sent 'stopped' announce"),
            Err(e) => warn!("Could not send 'stopped' announce: {}", e),
        }
    }

    /// Waits for room in the sink, but gives up once the run is cancelled
    async fn notify(&self, event: SwarmEvent) {
        let sink = match &self.sink {
            Some(sink) => sink,
            None => return,
        };
        let mut cancel = match &self.cancel {
            Some(cancel) => cancel.clone(),
            None => {
                if sink.send(event).await.is_err() {
                    debug!("Swarm event receiver dropped");
                }
                return;
            }
        };
        tokio::select! {
            biased;
            sent = sink.send(event) => {
                if sent.is_err() {
                    debug!("Swarm event receiver dropped");
                }
            }
            _ = wait_cancelled(&mut cancel) => {
                debug!("Session cancelled, dropping swarm event");
            }
        }
    }

    async fn report(&self, end: SessionEnd, messages: usize, ctx: &AnnounceContext) -> SessionReport {
        SessionReport {
            end,
            info_hash: ctx.info_hash,
            peer_id: ctx.peer_id,
            messages,
            attempts: self.tracker.summary().await,
        }
    }
}

/// Resolves once cancellation is requested. A dropped sender never cancels.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
