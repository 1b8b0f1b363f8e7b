//! Content descriptor loading
//!
//! A session needs only the content's info hash and total length. Where they
//! come from is behind [`MetadataLoader`]; the built-in loader reads a small
//! TOML descriptor:
//!
//! ```toml
//! info_hash = "08ada5a7a6183aae1e09d831df6748d566095a10"
//! length = 129241752
//! name = "Sintel"
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::codec::{CodecError, InfoHash};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
    #[error("invalid info hash: {0}")]
    InvalidInfoHash(#[from] CodecError),
}

/// What the swarm session needs to know about the content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDescriptor {
    pub info_hash: InfoHash,
    /// Total content length in bytes, announced as `left`
    pub total_length: u64,
    pub name: Option<String>,
}

pub trait MetadataLoader: Send + Sync {
    fn load_content_descriptor(&self, path: &Path) -> Result<ContentDescriptor, MetadataError>;
}

#[derive(Deserialize)]
struct DescriptorFile {
    info_hash: String,
    length: u64,
    #[serde(default)]
    name: Option<String>,
}

/// Reads TOML content descriptors from disk
#[derive(Debug, Clone, Copy, Default)]
pub struct DescriptorFileLoader;

impl DescriptorFileLoader {
    pub fn new() -> Self {
        Self
    }

    /// Parse descriptor text; `path` is only used in error messages
    pub fn parse(content: &str, path: &Path) -> Result<ContentDescriptor, MetadataError> {
        let file: DescriptorFile = toml::from_str(content).map_err(|e| MetadataError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(ContentDescriptor {
            info_hash: InfoHash::from_hex(file.info_hash.trim())?,
            total_length: file.length,
            name: file.name,
        })
    }
}

impl MetadataLoader for DescriptorFileLoader {
    fn load_content_descriptor(&self, path: &Path) -> Result<ContentDescriptor, MetadataError> {
        let content = std::fs::read_to_string(path).map_err(|source| MetadataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }
}
