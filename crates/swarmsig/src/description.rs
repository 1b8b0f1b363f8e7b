//! Negotiation descriptions (SDP offer/answer) as plain values
//!
//! The WebRTC collaborator has its own description type; the rest of the
//! crate only sees [`SessionDescription`], which matches the browser's
//! `{type, sdp}` JSON shape.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DescriptionError {
    #[error("malformed description: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Pranswer => write!(f, "pranswer"),
            SdpType::Answer => write!(f, "answer"),
            SdpType::Rollback => write!(f, "rollback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_answer(&self) -> bool {
        self.sdp_type == SdpType::Answer
    }

    /// JSON value in `{type, sdp}` form
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "type": self.sdp_type.to_string(),
            "sdp": self.sdp,
        })
    }

    /// Parse a `{type, sdp}` JSON value; extra keys are ignored
    pub fn from_value(value: &Value) -> Result<Self, DescriptionError> {
        Self::deserialize(value).map_err(|e| DescriptionError::Malformed(e.to_string()))
    }
}
