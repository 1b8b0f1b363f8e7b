//! Identifier codec for tracker wire fields
//!
//! The tracker speaks JSON, but `info_hash`, `peer_id` and `offer_id` are
//! fixed-length binary values. On the wire each byte becomes one character
//! (code point 0..=255), the same "binary string" encoding browser clients use.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

use crate::types::{ID_LEN, PEER_ID_PREFIX};

/// Errors from identifier conversion or generation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),
    #[error("entropy source unavailable: {0}")]
    EntropySource(String),
}

/// Reinterpret raw bytes as a one-byte-per-character string
pub fn bytes_to_binary_text(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`bytes_to_binary_text`]; rejects characters above U+00FF
pub fn binary_text_to_bytes(text: &str) -> Result<Vec<u8>, CodecError> {
    text.chars()
        .map(|c| {
            u8::try_from(c).map_err(|_| {
                CodecError::InvalidEncoding(format!("character {:?} is outside the byte range", c))
            })
        })
        .collect()
}

/// Decode a 20-byte hex identifier (optional `0x` prefix) into wire text
pub fn hex_to_binary_text(hex_str: &str) -> Result<String, CodecError> {
    decode_hex_id(hex_str).map(|bytes| bytes_to_binary_text(&bytes))
}

/// Fill `len` bytes from the OS random source and return them as wire text
pub fn random_identifier(len: usize) -> Result<String, CodecError> {
    random_bytes(len).map(|bytes| bytes_to_binary_text(&bytes))
}

/// Fill `len` bytes from the OS random source
pub fn random_bytes(len: usize) -> Result<Vec<u8>, CodecError> {
    let mut buf = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| CodecError::EntropySource(e.to_string()))?;
    Ok(buf)
}

fn decode_hex_id(hex_str: &str) -> Result<[u8; ID_LEN], CodecError> {
    let trimmed = hex_str.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let bytes = hex::decode(digits).map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    to_fixed(&bytes)
}

fn to_fixed(bytes: &[u8]) -> Result<[u8; ID_LEN], CodecError> {
    <[u8; ID_LEN]>::try_from(bytes).map_err(|_| {
        CodecError::InvalidEncoding(format!(
            "expected {} bytes, got {}",
            ID_LEN,
            bytes.len()
        ))
    })
}

macro_rules! binary_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            pub fn from_hex(hex_str: &str) -> Result<Self, CodecError> {
                decode_hex_id(hex_str).map(Self)
            }

            pub fn from_binary_text(text: &str) -> Result<Self, CodecError> {
                to_fixed(&binary_text_to_bytes(text)?).map(Self)
            }

            pub fn to_binary_text(&self) -> String {
                bytes_to_binary_text(&self.0)
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }

            /// First 8 hex chars, for log lines
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_binary_text())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let text = String::deserialize(deserializer)?;
                Self::from_binary_text(&text).map_err(serde::de::Error::custom)
            }
        }
    };
}

binary_id! {
    /// 20-byte swarm identifier (the torrent info hash)
    InfoHash
}

binary_id! {
    /// 20-byte identity of this client for the lifetime of a session
    PeerId
}

binary_id! {
    /// 20-byte correlator for one offer/answer negotiation attempt
    OfferId
}

impl PeerId {
    /// Version tag followed by base64 of 9 random bytes (8 + 12 = 20 bytes)
    pub fn generate() -> Result<Self, CodecError> {
        let suffix = STANDARD.encode(random_bytes(9)?);
        let mut bytes = [0u8; ID_LEN];
        let tag = PEER_ID_PREFIX.as_bytes();
        bytes[..tag.len()].copy_from_slice(tag);
        bytes[tag.len()..].copy_from_slice(suffix.as_bytes());
        Ok(Self(bytes))
    }
}

impl OfferId {
    pub fn random() -> Result<Self, CodecError> {
        to_fixed(&random_bytes(ID_LEN)?).map(Self)
    }
}
