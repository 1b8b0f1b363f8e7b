//! Negotiation tracker
//!
//! Owns every outbound offer/answer attempt of a session, keyed by the
//! locally generated [`OfferId`]. Answers from the tracker are matched by
//! exact id only; there is no fallback matching by peer or info hash since
//! several attempts can share both.
//!
//! ```text
//! Created -> OfferSent -> AnswerReceived -> Connected
//!               |               |
//!               +---> Failed <--+        (any non-terminal) -> Abandoned
//! ```
//!
//! The first valid answer for an attempt wins; later ones are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{CodecError, OfferId};
use crate::description::SessionDescription;
use crate::protocol::AnnounceResponse;
use crate::transport::{DataChannel, PeerConnectionFactory, TransportError};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("offer creation failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptState {
    Created,
    OfferSent,
    AnswerReceived,
    Connected,
    Failed,
    Abandoned,
}

impl AttemptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptState::Connected | AttemptState::Failed | AttemptState::Abandoned
        )
    }
}

impl std::fmt::Display for AttemptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptState::Created => write!(f, "created"),
            AttemptState::OfferSent => write!(f, "offer-sent"),
            AttemptState::AnswerReceived => write!(f, "answer-received"),
            AttemptState::Connected => write!(f, "connected"),
            AttemptState::Failed => write!(f, "failed"),
            AttemptState::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// One outstanding offer/answer exchange
pub struct NegotiationAttempt {
    offer_id: OfferId,
    state: AttemptState,
    /// Every state entered, in order
    history: Vec<AttemptState>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_peer_id: Option<String>,
    channel: Option<Arc<dyn DataChannel>>,
    created_at: Instant,
}

impl NegotiationAttempt {
    fn new(offer_id: OfferId) -> Self {
        Self {
            offer_id,
            state: AttemptState::Created,
            history: vec![AttemptState::Created],
            local_description: None,
            remote_description: None,
            remote_peer_id: None,
            channel: None,
            created_at: Instant::now(),
        }
    }

    fn transition(&mut self, next: AttemptState) {
        debug!(
            "Attempt {}: {} -> {}",
            self.offer_id.short(),
            self.state,
            next
        );
        self.state = next;
        self.history.push(next);
    }

    pub fn offer_id(&self) -> OfferId {
        self.offer_id
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    pub fn history(&self) -> &[AttemptState] {
        &self.history
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn remote_peer_id(&self) -> Option<&str> {
        self.remote_peer_id.as_deref()
    }
}

/// Swarm statistics carried by a tracker response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwarmStats {
    pub interval: Option<u64>,
    pub complete: Option<u64>,
    pub incomplete: Option<u64>,
}

/// Outcome reported to the session
#[derive(Clone)]
pub enum TrackerEvent {
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
}

impl std::fmt::Debug for TrackerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackerEvent::SwarmStats(stats) => f.debug_tuple("SwarmStats").field(stats).finish(),
            TrackerEvent::PeerConnected {
                offer_id, peer_id, ..
            } => f
                .debug_struct("PeerConnected")
                .field("offer_id", offer_id)
                .field("peer_id", peer_id)
                .finish_non_exhaustive(),
            TrackerEvent::NegotiationFailed { offer_id, cause } => f
                .debug_struct("NegotiationFailed")
                .field("offer_id", offer_id)
                .field("cause", cause)
                .finish(),
        }
    }
}

/// Attempt counts by state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptSummary {
    pub created: usize,
    pub offer_sent: usize,
    pub answer_received: usize,
    pub connected: usize,
    pub failed: usize,
    pub abandoned: usize,
}

impl AttemptSummary {
    pub fn total(&self) -> usize {
        self.created
            + self.offer_sent
            + self.answer_received
            + self.connected
            + self.failed
            + self.abandoned
    }
}

/// Tracks negotiation attempts and drives the connection factory
pub struct NegotiationTracker<F: PeerConnectionFactory> {
    factory: Arc<F>,
    /// Attempts are never removed, so an id is never reused within a session
    attempts: RwLock<HashMap<OfferId, NegotiationAttempt>>,
}

impl<F: PeerConnectionFactory> NegotiationTracker<F> {
    pub fn new(factory: Arc<F>) -> Self {
        Self {
            factory,
            attempts: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &Arc<F> {
        &self.factory
    }

    /// Start a new attempt and return its id with the local offer
    pub async fn create_attempt(&self) -> Result<(OfferId, SessionDescription), TrackerError> {
        // Reserve the id before asking for an offer so concurrent calls cannot collide
        let offer_id = {
            let mut attempts = self.attempts.write().await;
            let offer_id = loop {
                let candidate = OfferId::random()?;
                if !attempts.contains_key(&candidate) {
                    break candidate;
                }
            };
            attempts.insert(offer_id, NegotiationAttempt::new(offer_id));
            offer_id
        };

        let offer = match self.factory.create_offer(offer_id).await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Offer creation failed for attempt {}: {}", offer_id.short(), e);
                if let Some(attempt) = self.attempts.write().await.get_mut(&offer_id) {
                    attempt.transition(AttemptState::Failed);
                }
                return Err(e.into());
            }
        };

        let still_wanted = {
            let mut attempts = self.attempts.write().await;
            match attempts.get_mut(&offer_id) {
                Some(attempt) if attempt.state == AttemptState::Created => {
                    attempt.local_description = Some(offer.clone());
                    attempt.transition(AttemptState::OfferSent);
                    true
                }
                _ => false,
            }
        };
        if !still_wanted {
            // Session was torn down while the offer was being generated
            self.factory.close(offer_id).await;
            return Err(TransportError::Disconnected.into());
        }

        debug!("Attempt {} offer ready ({} bytes SDP)", offer_id.short(), offer.sdp.len());
        Ok((offer_id, offer))
    }

    /// Process one decoded tracker response
    pub async fn handle_inbound(&self, response: &AnnounceResponse) -> Vec<TrackerEvent> {
        let mut events = Vec::new();

        if response.has_stats() {
            events.push(TrackerEvent::SwarmStats(SwarmStats {
                interval: response.interval,
                complete: response.complete,
                incomplete: response.incomplete,
            }));
        }

        match response.answer() {
            Some(Ok((offer_id, answer))) => {
                if let Some(event) = self
                    .handle_answer(offer_id, answer, response.peer_id.clone())
                    .await
                {
                    events.push(event);
                }
            }
            Some(Err(e)) => warn!("Ignoring answer: {}", e),
            None => {}
        }

        events
    }

    /// Apply an answer to the attempt it names
    pub async fn handle_answer(
        &self,
        offer_id: OfferId,
        answer: SessionDescription,
        peer_id: Option<String>,
    ) -> Option<TrackerEvent> {
        if !answer.is_answer() {
            warn!(
                "Ignoring '{}' description sent as answer for {}",
                answer.sdp_type,
                offer_id.short()
            );
            return None;
        }

        {
            let mut attempts = self.attempts.write().await;
            let attempt = match attempts.get_mut(&offer_id) {
                Some(attempt) => attempt,
                None => {
                    debug!("Unmatched answer for {} (unknown or expired attempt)", offer_id.short());
                    return None;
                }
            };
            if attempt.state != AttemptState::OfferSent {
                debug!(
                    "Ignoring answer for {} in state {}",
                    offer_id.short(),
                    attempt.state
                );
                return None;
            }
            attempt.remote_description = Some(answer.clone());
            attempt.remote_peer_id = peer_id.clone();
            attempt.transition(AttemptState::AnswerReceived);
        }

        let result = self.factory.accept_answer(offer_id, &answer).await;

        let mut attempts = self.attempts.write().await;
        let attempt = attempts.get_mut(&offer_id)?;
        if attempt.state != AttemptState::AnswerReceived {
            // Abandoned while the transport was applying the answer
            drop(attempts);
            if let Ok(channel) = result {
                channel.close().await;
            }
            return None;
        }

        match result {
            Ok(channel) => {
                attempt.channel = Some(channel.clone());
                attempt.transition(AttemptState::Connected);
                info!(
                    "Attempt {} connected to peer {}",
                    offer_id.short(),
                    peer_id.as_deref().unwrap_or("<unknown>")
                );
                Some(TrackerEvent::PeerConnected {
                    offer_id,
                    peer_id,
                    channel,
                })
            }
            Err(e) => {
                attempt.transition(AttemptState::Failed);
                drop(attempts);
                warn!("Attempt {} rejected by transport: {}", offer_id.short(), e);
                self.factory.close(offer_id).await;
                Some(TrackerEvent::NegotiationFailed {
                    offer_id,
                    cause: e.to_string(),
                })
            }
        }
    }

    /// Explicit failure signal (e.g. the peer connection reported `failed`)
    pub async fn fail_attempt(&self, offer_id: OfferId, cause: &str) -> Option<TrackerEvent> {
        {
            let mut attempts = self.attempts.write().await;
            let attempt = attempts.get_mut(&offer_id)?;
            if !matches!(
                attempt.state,
                AttemptState::OfferSent | AttemptState::AnswerReceived
            ) {
                return None;
            }
            attempt.transition(AttemptState::Failed);
        }
        warn!("Attempt {} failed: {}", offer_id.short(), cause);
        self.factory.close(offer_id).await;
        Some(TrackerEvent::NegotiationFailed {
            offer_id,
            cause: cause.to_string(),
        })
    }

    /// Fail attempts that have waited in `OfferSent` longer than `max_age`
    pub async fn expire_stale(&self, max_age: Duration) -> Vec<TrackerEvent> {
        let expired: Vec<OfferId> = {
            let mut attempts = self.attempts.write().await;
            attempts
                .values_mut()
                .filter(|a| a.state == AttemptState::OfferSent && a.created_at.elapsed() >= max_age)
                .map(|a| {
                    a.transition(AttemptState::Failed);
                    a.offer_id
                })
                .collect()
        };

        let mut events = Vec::with_capacity(expired.len());
        for offer_id in expired {
            warn!("Attempt {} got no answer within {:?}", offer_id.short(), max_age);
            self.factory.close(offer_id).await;
            events.push(TrackerEvent::NegotiationFailed {
                offer_id,
                cause: format!("no answer within {:?}", max_age),
            });
        }
        events
    }

    /// Mark every non-terminal attempt `Abandoned` and release its connection
    pub async fn abandon_all(&self) -> Vec<OfferId> {
        let abandoned: Vec<OfferId> = {
            let mut attempts = self.attempts.write().await;
            attempts
                .values_mut()
                .filter(|a| !a.state.is_terminal())
                .map(|a| {
                    a.transition(AttemptState::Abandoned);
                    a.offer_id
                })
                .collect()
        };
        for offer_id in &abandoned {
            self.factory.close(*offer_id).await;
        }
        abandoned
    }

    pub async fn state(&self, offer_id: &OfferId) -> Option<AttemptState> {
        self.attempts.read().await.get(offer_id).map(|a| a.state)
    }

    pub async fn history(&self, offer_id: &OfferId) -> Option<Vec<AttemptState>> {
        self.attempts
            .read()
            .await
            .get(offer_id)
            .map(|a| a.history.clone())
    }

    pub async fn remote_description(&self, offer_id: &OfferId) -> Option<SessionDescription> {
        self.attempts
            .read()
            .await
            .get(offer_id)
            .and_then(|a| a.remote_description.clone())
    }

    pub async fn channel(&self, offer_id: &OfferId) -> Option<Arc<dyn DataChannel>> {
        self.attempts
            .read()
            .await
            .get(offer_id)
            .and_then(|a| a.channel.clone())
    }

    /// Data channels of all connected attempts
    pub async fn connected_channels(&self) -> Vec<(OfferId, Arc<dyn DataChannel>)> {
        self.attempts
            .read()
            .await
            .values()
            .filter_map(|a| a.channel.clone().map(|c| (a.offer_id, c)))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.attempts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.attempts.read().await.is_empty()
    }

    pub async fn summary(&self) -> AttemptSummary {
        let attempts = self.attempts.read().await;
        let mut summary = AttemptSummary::default();
        for attempt in attempts.values() {
            match attempt.state {
                AttemptState::Created => summary.created += 1,
                AttemptState::OfferSent => summary.offer_sent += 1,
                AttemptState::AnswerReceived => summary.answer_received += 1,
                AttemptState::Connected => summary.connected += 1,
                AttemptState::Failed => summary.failed += 1,
                AttemptState::Abandoned => summary.abandoned += 1,
            }
        }
        summary
    }
}
