//! Mock implementations for testing
//!
//! In-memory stand-ins for the tracker connection, the WebRTC stack and the
//! descriptor loader. Tests script the tracker through a [`MockRelayHandle`]
//! and inspect what the client sent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::codec::OfferId;
use crate::description::SessionDescription;
use crate::metadata::{ContentDescriptor, MetadataError, MetadataLoader};
use crate::transport::{
    ConnectionState, DataChannel, EventTx, InboundEvent, PeerConnectionFactory, RelayTransport,
    TransportError, TransportEvent,
};
use crate::types::DATA_CHANNEL_LABEL;

/// How long [`MockRelayHandle::next_sent`] waits before giving up
const SENT_WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Mock Relay Transport
// ============================================================================

enum MockFrame {
    Text(String),
    Close,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectBehavior {
    Accept,
    Refuse,
    /// `connect` never completes
    Stall,
}

/// Relay transport fed from a [`MockRelayHandle`]
pub struct MockRelayTransport {
    behavior: ConnectBehavior,
    connected: AtomicBool,
    /// Set once a close or error frame has been delivered
    ended: AtomicBool,
    connects: AtomicUsize,
    inbound: Mutex<mpsc::UnboundedReceiver<MockFrame>>,
    sent: mpsc::UnboundedSender<String>,
}

/// Test-side controls of a [`MockRelayTransport`]
pub struct MockRelayHandle {
    inbound: mpsc::UnboundedSender<MockFrame>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl MockRelayTransport {
    pub fn new() -> (Arc<Self>, MockRelayHandle) {
        Self::build(ConnectBehavior::Accept)
    }

    /// A relay whose `connect` always fails
    pub fn refusing() -> (Arc<Self>, MockRelayHandle) {
        Self::build(ConnectBehavior::Refuse)
    }

    /// A relay whose `connect` hangs forever
    pub fn stalled() -> (Arc<Self>, MockRelayHandle) {
        Self::build(ConnectBehavior::Stall)
    }

    fn build(behavior: ConnectBehavior) -> (Arc<Self>, MockRelayHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let relay = Arc::new(Self {
            behavior,
            connected: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            inbound: Mutex::new(inbound_rx),
            sent: sent_tx,
        });
        let handle = MockRelayHandle {
            inbound: inbound_tx,
            sent: sent_rx,
        };
        (relay, handle)
    }

    /// Number of successful `connect` calls
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayTransport for MockRelayTransport {
    async fn connect(&self, url: &str) -> Result<(), TransportError> {
        match self.behavior {
            ConnectBehavior::Accept => {}
            ConnectBehavior::Refuse => {
                return Err(TransportError::ConnectionFailed(format!(
                    "{}: connection refused",
                    url
                )));
            }
            ConnectBehavior::Stall => std::future::pending::<()>().await,
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.sent
            .send(text)
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Option<Result<String, TransportError>> {
        if self.ended.load(Ordering::SeqCst) {
            return None;
        }
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(MockFrame::Text(text)) => Some(Ok(text)),
            Some(MockFrame::Close) | None => {
                self.ended.store(true, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                None
            }
            Some(MockFrame::Error(reason)) => {
                self.ended.store(true, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                Some(Err(TransportError::ReceiveFailed(reason)))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl MockRelayHandle {
    /// Queue a text frame from the tracker
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.inbound.send(MockFrame::Text(text.into()));
    }

    /// Queue a clean close
    pub fn close(&self) {
        let _ = self.inbound.send(MockFrame::Close);
    }

    /// Queue a read error
    pub fn fail(&self, reason: &str) {
        let _ = self.inbound.send(MockFrame::Error(reason.to_string()));
    }

    /// Next frame the client sent, or `None` if nothing arrives in time
    pub async fn next_sent(&mut self) -> Option<String> {
        tokio::time::timeout(SENT_WAIT, self.sent.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next sent frame parsed as JSON
    pub async fn next_sent_json(&mut self) -> Option<serde_json::Value> {
        let text = self.next_sent().await?;
        serde_json::from_str(&text).ok()
    }

    /// Sent frame if one is already queued
    pub fn try_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }
}

// ============================================================================
// Mock Connection Factory
// ============================================================================

/// Peer connection factory without a network
///
/// Answers whose SDP contains `reject` are refused, everything else
/// "connects" immediately and reports the channel as open on the event channel.
pub struct MockConnectionFactory {
    events: EventTx,
    fail_offers: AtomicBool,
    pending: RwLock<HashMap<OfferId, SessionDescription>>,
    accepted: RwLock<Vec<OfferId>>,
    closed: RwLock<Vec<OfferId>>,
}

impl MockConnectionFactory {
    pub fn new(events: EventTx) -> Self {
        Self {
            events,
            fail_offers: AtomicBool::new(false),
            pending: RwLock::new(HashMap::new()),
            accepted: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    /// Make subsequent `create_offer` calls fail
    pub fn set_fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Attempts whose answer was applied, in order
    pub async fn accepted(&self) -> Vec<OfferId> {
        self.accepted.read().await.clone()
    }

    /// Attempts torn down through `close`, in order
    pub async fn closed(&self) -> Vec<OfferId> {
        self.closed.read().await.clone()
    }

    pub async fn local_offer(&self, offer_id: &OfferId) -> Option<SessionDescription> {
        self.pending.read().await.get(offer_id).cloned()
    }

    /// Inject a transport callback, as the real stack would raise it
    pub fn emit(&self, event: TransportEvent) {
        // try_send: the dispatcher may be the caller
        if self.events.try_send(InboundEvent::Transport(event)).is_err() {
            tracing::debug!("Mock transport event dropped");
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create_offer(&self, offer_id: OfferId) -> Result<SessionDescription, TransportError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "mock offer failure".to_string(),
            ));
        }
        let offer = SessionDescription::offer(format!(
            "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\na=mock-offer:{}\r\n",
            offer_id.to_hex()
        ));
        self.pending.write().await.insert(offer_id, offer.clone());
        self.emit(TransportEvent::StateChanged {
            offer_id,
            state: ConnectionState::New,
        });
        Ok(offer)
    }

    async fn accept_answer(
        &self,
        offer_id: OfferId,
        answer: &SessionDescription,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        if !self.pending.read().await.contains_key(&offer_id) {
            return Err(TransportError::ConnectionFailed(format!(
                "no pending connection for {}",
                offer_id.short()
            )));
        }
        if answer.sdp.contains("reject") {
            return Err(TransportError::Rejected("mock rejected answer".to_string()));
        }
        self.accepted.write().await.push(offer_id);

        let channel = Arc::new(MockDataChannel::new(DATA_CHANNEL_LABEL));
        self.emit(TransportEvent::StateChanged {
            offer_id,
            state: ConnectionState::Connected,
        });
        self.emit(TransportEvent::ChannelOpen {
            offer_id,
            label: DATA_CHANNEL_LABEL.to_string(),
        });
        Ok(channel)
    }

    async fn close(&self, offer_id: OfferId) {
        self.pending.write().await.remove(&offer_id);
        self.closed.write().await.push(offer_id);
    }
}

// ============================================================================
// Mock Data Channel
// ============================================================================

/// Data channel that records what was sent on it
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    sent: RwLock<Vec<Vec<u8>>>,
}

impl MockDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(true),
            sent: RwLock::new(Vec::new()),
        }
    }

    pub async fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.sent.write().await.push(data);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// Static Metadata Loader
// ============================================================================

/// Loader that ignores the path and returns a fixed descriptor
pub struct StaticMetadataLoader {
    descriptor: ContentDescriptor,
}

impl StaticMetadataLoader {
    pub fn new(descriptor: ContentDescriptor) -> Self {
        Self { descriptor }
    }
}

impl MetadataLoader for StaticMetadataLoader {
    fn load_content_descriptor(&self, _path: &Path) -> Result<ContentDescriptor, MetadataError> {
        Ok(self.descriptor.clone())
    }
}
