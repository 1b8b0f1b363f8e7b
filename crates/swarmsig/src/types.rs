//! Shared configuration and constants

use std::time::Duration;

/// Length of every binary identifier on the wire
pub const ID_LEN: usize = 20;

/// Client/version tag at the start of generated peer ids
pub const PEER_ID_PREFIX: &str = "-WW0007-";

/// Label of the data channel opened on every outbound connection
pub const DATA_CHANNEL_LABEL: &str = "webrtc-datachannel";

pub const DEFAULT_TRACKER_URL: &str = "wss://tracker.openwebtorrent.com/";

pub const DEFAULT_ICE_SERVERS: &[&str] = &["stun:stun.l.google.com:19302"];

/// Default number of offers per announce
pub const DEFAULT_NUMWANT: usize = 1;

/// Buffer size of the inbound event channel
pub const EVENT_CHANNEL_SIZE: usize = 256;

/// Configuration for one swarm session
#[derive(Debug, Clone)]
pub struct SwarmConfig {
    /// Tracker WebSocket URL
    pub tracker_url: String,
    /// Offers created per announce cycle
    pub numwant: usize,
    /// Stop after this many inbound tracker messages
    pub max_messages: Option<usize>,
    /// Stop when no tracker message arrives for this long
    pub idle_timeout: Option<Duration>,
    /// Stop after this long regardless of activity
    pub session_timeout: Option<Duration>,
    /// Fail attempts that sit in `OfferSent` for longer than this
    pub attempt_timeout: Option<Duration>,
    /// Send a `stopped` announce on graceful shutdown
    pub announce_stopped: bool,
    /// Re-announce with fresh offers when the tracker's interval elapses
    pub reannounce: bool,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            tracker_url: DEFAULT_TRACKER_URL.to_string(),
            numwant: DEFAULT_NUMWANT,
            max_messages: None,
            idle_timeout: None,
            session_timeout: None,
            attempt_timeout: None,
            announce_stopped: true,
            reannounce: false,
        }
    }
}
