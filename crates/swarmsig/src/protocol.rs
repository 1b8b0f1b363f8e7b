//! Tracker wire protocol
//!
//! WebTorrent trackers exchange JSON text frames over a WebSocket.
//! Outbound we only send announces; inbound frames are announce responses
//! that may carry swarm statistics, an answer to one of our offers, or both.
//!
//! Binary fields (`info_hash`, `peer_id`, `offer_id`) use the one-char-per-byte
//! encoding from [`crate::codec`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::{CodecError, InfoHash, OfferId, PeerId};
use crate::description::{DescriptionError, SessionDescription};

pub const ACTION_ANNOUNCE: &str = "announce";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid offer id: {0}")]
    InvalidOfferId(CodecError),
    #[error("invalid answer: {0}")]
    InvalidAnswer(#[from] DescriptionError),
}

/// Announce lifecycle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
    Update,
}

impl std::fmt::Display for AnnounceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnounceEvent::Started => write!(f, "started"),
            AnnounceEvent::Stopped => write!(f, "stopped"),
            AnnounceEvent::Completed => write!(f, "completed"),
            AnnounceEvent::Update => write!(f, "update"),
        }
    }
}

/// One offer embedded in an announce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceOffer {
    pub offer_id: OfferId,
    pub offer: SessionDescription,
}

/// Outbound announce, field order as the tracker documents it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceRequest {
    pub numwant: usize,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
    pub action: String,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub offers: Vec<AnnounceOffer>,
}

/// Transfer counters reported with every announce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

impl AnnounceRequest {
    /// Build an announce. The tracker hands out at most one peer per offer,
    /// so `numwant` should not exceed `offers.len()`.
    pub fn new(
        info_hash: InfoHash,
        peer_id: PeerId,
        numwant: usize,
        stats: TransferStats,
        event: AnnounceEvent,
        offers: Vec<AnnounceOffer>,
    ) -> Self {
        Self {
            numwant,
            uploaded: stats.uploaded,
            downloaded: stats.downloaded,
            left: stats.left,
            event,
            action: ACTION_ANNOUNCE.to_string(),
            info_hash,
            peer_id,
            offers,
        }
    }
}

/// Inbound announce response. Everything is optional: a frame may carry only
/// statistics, only an answer, or a tracker failure message.
///
/// Binary fields stay as text here so that a bad correlator only costs the
/// answer, not the statistics in the same frame.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AnnounceResponse {
    #[serde(default)]
    pub info_hash: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub complete: Option<u64>,
    #[serde(default)]
    pub incomplete: Option<u64>,
    #[serde(default)]
    pub peer_id: Option<String>,
    /// Kept raw; the tracker turns it into a description when it matches an attempt
    #[serde(default)]
    pub answer: Option<Value>,
    #[serde(default)]
    pub offer_id: Option<String>,
    #[serde(default, rename = "failure reason")]
    pub failure_reason: Option<String>,
    #[serde(default, rename = "warning message")]
    pub warning_message: Option<String>,
}

impl AnnounceResponse {
    pub fn has_stats(&self) -> bool {
        self.interval.is_some() || self.complete.is_some() || self.incomplete.is_some()
    }

    pub fn info_hash(&self) -> Option<Result<InfoHash, CodecError>> {
        self.info_hash.as_deref().map(InfoHash::from_binary_text)
    }

    /// `Some` only when both the answer and its correlator are present
    pub fn answer(&self) -> Option<Result<(OfferId, SessionDescription), ProtocolError>> {
        let (offer_id, answer) = match (&self.offer_id, &self.answer) {
            (Some(offer_id), Some(answer)) => (offer_id, answer),
            _ => return None,
        };
        Some(
            OfferId::from_binary_text(offer_id)
                .map_err(ProtocolError::InvalidOfferId)
                .and_then(|id| Ok((id, SessionDescription::from_value(answer)?))),
        )
    }
}

/// Serialize an announce to a text frame
pub fn encode_request(req: &AnnounceRequest) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(req)?)
}

/// Parse a text frame. Unknown keys are ignored; only syntax errors and
/// fields of the wrong JSON type fail.
pub fn decode_response(text: &str) -> Result<AnnounceResponse, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::MalformedResponse(e.to_string()))
}
