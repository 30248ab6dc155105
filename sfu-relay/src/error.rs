use thiserror::Error;

use crate::types::{PeerId, TrackId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Peer {0} is closing")]
    PeerClosing(PeerId),

    #[error("Track {0} belongs to this peer")]
    OwnTrack(TrackId),

    #[error("Track {0} does not belong to this peer")]
    TrackNotOwned(TrackId),

    #[error("Track {0} is already relayed by this peer")]
    AlreadyRelaying(TrackId),

    #[error("Track {0} is already being sent by this peer")]
    AlreadySending(TrackId),

    #[error("Track {0} is not being sent by this peer")]
    NotSending(TrackId),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Whether the error came from a lifecycle gate rather than bad input
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        matches!(self, Self::PeerClosing(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
