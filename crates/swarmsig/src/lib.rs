//! WebTorrent tracker signaling client
//!
//! Joins a swarm through a WebTorrent WebSocket tracker and negotiates WebRTC
//! data channels with the peers the tracker pairs us with.
//!
//! # Overview
//!
//! - **Identifiers**: 20-byte info hash, peer id and offer id, sent as
//!   one-char-per-byte text ([`codec`])
//! - **Announces**: JSON requests carrying WebRTC offers ([`protocol`])
//! - **Negotiation**: every offer is an attempt tracked by its offer id until
//!   the matching answer connects or it fails ([`tracker`])
//! - **Session**: one dispatcher loop over tracker frames and peer callbacks
//!   ([`session`])
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use swarmsig::{
//!     event_channel, DescriptorFileLoader, RtcConnectionFactory, SwarmConfig, SwarmSession,
//!     WsRelayTransport, EVENT_CHANNEL_SIZE,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (events_tx, events_rx) = event_channel(EVENT_CHANNEL_SIZE);
//!     let factory = Arc::new(RtcConnectionFactory::new(
//!         vec!["stun:stun.l.google.com:19302".to_string()],
//!         events_tx.clone(),
//!     ));
//!     let relay = Arc::new(WsRelayTransport::new());
//!
//!     let mut session = SwarmSession::new(SwarmConfig::default(), relay, factory, (events_tx, events_rx));
//!     let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
//!     let report = session
//!         .run(&DescriptorFileLoader::new(), Path::new("sintel.toml"), cancel_rx)
//!         .await?;
//!     println!("{:?}", report.attempts);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod description;
pub mod metadata;
pub mod mock;
pub mod protocol;
pub mod real_factory;
pub mod rendezvous;
pub mod session;
pub mod tracker;
pub mod transport;
pub mod types;

pub use codec::{
    binary_text_to_bytes, bytes_to_binary_text, hex_to_binary_text, random_identifier, CodecError,
    InfoHash, OfferId, PeerId,
};
pub use description::{DescriptionError, SdpType, SessionDescription};
pub use metadata::{ContentDescriptor, DescriptorFileLoader, MetadataError, MetadataLoader};
pub use protocol::{
    decode_response, encode_request, AnnounceEvent, AnnounceOffer, AnnounceRequest,
    AnnounceResponse, ProtocolError, TransferStats,
};
pub use real_factory::{RtcConnectionFactory, RtcDataChannel};
pub use rendezvous::{RendezvousSession, WsRelayTransport};
pub use session::{SessionEnd, SessionReport, SwarmError, SwarmEvent, SwarmSession};
pub use tracker::{
    AttemptState, AttemptSummary, NegotiationAttempt, NegotiationTracker, SwarmStats,
    TrackerError, TrackerEvent,
};
pub use transport::{
    event_channel, ConnectionState, DataChannel, EventRx, EventTx, InboundEvent,
    PeerConnectionFactory, RelayTransport, TransportError, TransportEvent,
};
pub use types::{
    SwarmConfig, DATA_CHANNEL_LABEL, DEFAULT_ICE_SERVERS, DEFAULT_NUMWANT, DEFAULT_TRACKER_URL,
    EVENT_CHANNEL_SIZE, ID_LEN, PEER_ID_PREFIX,
};
