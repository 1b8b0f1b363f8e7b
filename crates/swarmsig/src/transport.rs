//! Transport abstraction
//!
//! Traits for the tracker connection and for peer connections, implemented
//! by the real WebSocket/WebRTC backends and by the in-memory mocks.
//!
//! Everything that happens "outside" the dispatcher (tracker frames, peer
//! connection callbacks) is delivered as an [`InboundEvent`] on one channel.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::codec::OfferId;
use crate::description::SessionDescription;

/// Errors from relay or peer transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
    #[error("Remote description rejected: {0}")]
    Rejected(String),
}

/// Persistent text-frame connection to the tracker
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open the connection; returns once the handshake completes
    async fn connect(&self, url: &str) -> Result<(), TransportError>;

    /// Close the connection. Safe to call more than once.
    async fn disconnect(&self);

    /// Send one text frame
    async fn send(&self, text: String) -> Result<(), TransportError>;

    /// Next inbound text frame.
    /// `None` once the connection has closed; `Some(Err)` is terminal.
    async fn recv(&self) -> Option<Result<String, TransportError>>;

    fn is_connected(&self) -> bool;
}

/// Data channel on an established peer connection
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Creates outbound peer connections, keyed by the attempt that owns them
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection with a data channel and return its local offer
    async fn create_offer(&self, offer_id: OfferId) -> Result<SessionDescription, TransportError>;

    /// Apply the remote answer; returns the data channel on success
    async fn accept_answer(
        &self,
        offer_id: OfferId,
        answer: &SessionDescription,
    ) -> Result<Arc<dyn DataChannel>, TransportError>;

    /// Tear down the connection for an attempt, if any
    async fn close(&self, offer_id: OfferId);
}

/// Peer connection state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Notification raised by a peer connection or its data channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged {
        offer_id: OfferId,
        state: ConnectionState,
    },
    ChannelOpen {
        offer_id: OfferId,
        label: String,
    },
    ChannelMessage {
        offer_id: OfferId,
        data: Vec<u8>,
    },
    ChannelClosed {
        offer_id: OfferId,
    },
}

/// Everything the session dispatcher consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Raw text frame from the tracker
    Relay(String),
    /// Tracker connection closed cleanly
    RelayClosed,
    /// Tracker connection failed; no more frames follow
    RelayError(TransportError),
    Transport(TransportEvent),
}

pub type EventTx = mpsc::Sender<InboundEvent>;
pub type EventRx = mpsc::Receiver<InboundEvent>;

/// Create the inbound event channel shared by the relay pump and the peer transport
pub fn event_channel(buffer: usize) -> (EventTx, EventRx) {
    mpsc::channel(buffer)
}
