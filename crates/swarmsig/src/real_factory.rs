//! WebRTC peer connection factory
//!
//! Implements [`PeerConnectionFactory`] on the webrtc crate. Every attempt
//! gets its own `RTCPeerConnection` with one data channel; connection and
//! channel callbacks are forwarded to the session as [`InboundEvent`]s.
//!
//! Trickle ICE is not available through the tracker, so offers are only
//! returned once ICE gathering has finished (or the gather timeout hits).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::codec::OfferId;
use crate::description::{SdpType, SessionDescription};
use crate::transport::{
    ConnectionState, DataChannel, EventTx, InboundEvent, PeerConnectionFactory, TransportError,
    TransportEvent,
};
use crate::types::DATA_CHANNEL_LABEL;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Default upper bound on ICE gathering per offer
pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// [`DataChannel`] over an `RTCDataChannel`
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.dc.label()
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.dc
            .send(&bytes::Bytes::from(data))
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }
}

struct RtcConnection {
    pc: Arc<RTCPeerConnection>,
    dc: Arc<RTCDataChannel>,
}

/// Creates real WebRTC connections
pub struct RtcConnectionFactory {
    ice_servers: Vec<String>,
    gather_timeout: Duration,
    events: EventTx,
    connections: RwLock<HashMap<OfferId, RtcConnection>>,
}

impl RtcConnectionFactory {
    pub fn new(ice_servers: Vec<String>, events: EventTx) -> Self {
        Self {
            ice_servers,
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            events,
            connections: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    async fn create_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let mut config = RTCConfiguration::default();
        if !self.ice_servers.is_empty() {
            config.ice_servers = vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }];
        }

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))
    }

    /// Forward connection and channel callbacks for one attempt.
    /// Work must happen inside the returned futures.
    /// Open the data channel, create the offer and wait for ICE gathering.
    /// The caller owns `pc` and closes it on error.
    async fn negotiate_offer(
        &self,
        offer_id: OfferId,
        pc: &RTCPeerConnection,
    ) -> Result<(SessionDescription, Arc<RTCDataChannel>), TransportError> {
        let dc = pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.install_handlers(offer_id, pc, &dc);

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let mut gathering_complete = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        if tokio::time::timeout(self.gather_timeout, gathering_complete.recv())
            .await
            .is_err()
        {
            warn!(
                "ICE gathering for attempt {} not complete after {:?}, sending partial offer",
                offer_id.short(),
                self.gather_timeout
            );
        }

        let local = pc.local_description().await.ok_or_else(|| {
            TransportError::ConnectionFailed("no local description after gathering".to_string())
        })?;
        let offer = from_rtc_description(&local)?;
        debug!("Attempt {} offer SDP: {} bytes", offer_id.short(), offer.sdp.len());
        Ok((offer, dc))
    }

    fn install_handlers(&self, offer_id: OfferId, pc: &RTCPeerConnection, dc: &RTCDataChannel) {
        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            Box::pin(async move {
                debug!("Attempt {} peer connection state: {}", offer_id.short(), state);
                let state = match state {
                    RTCPeerConnectionState::New => ConnectionState::New,
                    RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                    RTCPeerConnectionState::Connected => ConnectionState::Connected,
                    RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                    RTCPeerConnectionState::Failed => ConnectionState::Failed,
                    RTCPeerConnectionState::Closed => ConnectionState::Closed,
                    _ => return,
                };
                let _ = events
                    .send(InboundEvent::Transport(TransportEvent::StateChanged {
                        offer_id,
                        state,
                    }))
                    .await;
            })
        }));

        let events = self.events.clone();
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            Box::pin(async move {
                info!("Attempt {} data channel '{}' open", offer_id.short(), label);
                let _ = events
                    .send(InboundEvent::Transport(TransportEvent::ChannelOpen {
                        offer_id,
                        label,
                    }))
                    .await;
            })
        }));

        let events = self.events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            Box::pin(async move {
                let _ = events
                    .send(InboundEvent::Transport(TransportEvent::ChannelMessage {
                        offer_id,
                        data: msg.data.to_vec(),
                    }))
                    .await;
            })
        }));

        let events = self.events.clone();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            Box::pin(async move {
                let _ = events
                    .send(InboundEvent::Transport(TransportEvent::ChannelClosed { offer_id }))
                    .await;
            })
        }));
    }
}

/// Convert a remote description for the webrtc crate
fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let sdp = desc.sdp.clone();
    let converted = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(sdp),
        SdpType::Answer => RTCSessionDescription::answer(sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(sdp),
        SdpType::Rollback => {
            return Err(TransportError::Rejected(
                "rollback is not a remote description".to_string(),
            ))
        }
    };
    converted.map_err(|e| TransportError::Rejected(e.to_string()))
}

fn from_rtc_description(desc: &RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(TransportError::ConnectionFailed(format!(
                "unexpected local description type: {}",
                other
            )))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp.clone(),
    })
}

#[async_trait]
impl PeerConnectionFactory for RtcConnectionFactory {
    async fn create_offer(&self, offer_id: OfferId) -> Result<SessionDescription, TransportError> {
        let pc = self.create_connection().await?;
        match self.negotiate_offer(offer_id, &pc).await {
            Ok((offer, dc)) => {
                self.connections
                    .write()
                    .await
                    .insert(offer_id, RtcConnection { pc, dc });
                Ok(offer)
            }
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!("Closing attempt {} connection: {}", offer_id.short(), close_err);
                }
                Err(e)
            }
        }
    }

    async fn accept_answer(
        &self,
        offer_id: OfferId,
        answer: &SessionDescription,
    ) -> Result<Arc<dyn DataChannel>, TransportError> {
        let (pc, dc) = {
            let connections = self.connections.read().await;
            let conn = connections.get(&offer_id).ok_or_else(|| {
                TransportError::ConnectionFailed(format!(
                    "no pending connection for {}",
                    offer_id.short()
                ))
            })?;
            (conn.pc.clone(), conn.dc.clone())
        };

        pc.set_remote_description(to_rtc_description(answer)?)
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        Ok(Arc::new(RtcDataChannel { dc }))
    }

    async fn close(&self, offer_id: OfferId) {
        let conn = self.connections.write().await.remove(&offer_id);
        if let Some(conn) = conn {
            let _ = conn.dc.close().await;
            if let Err(e) = conn.pc.close().await {
                debug!("Closing attempt {} connection: {}", offer_id.short(), e);
            }
        }
    }
}
