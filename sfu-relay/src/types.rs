//! Common identifier types shared by negotiation and relay

use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between a remote track id and the suffix of a derived local track id
pub const LOCAL_TRACK_SEPARATOR: &str = "::";

// Identifiers are opaque strings that travel through signaling and SDP as-is
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id! {
    /// Unique identifier for a participant
    ///
    /// Negotiators and forwarding peers share this id space, and relayed
    /// tracks carry the publisher's id as their stream id.
    PeerId
}

string_id! {
    /// Unique identifier for a media track, remote or local
    TrackId
}

impl TrackId {
    /// Derive a fresh local track id for relaying this remote track.
    ///
    /// Every call yields a different id, so reconnecting the same remote
    /// track never reuses a local id.
    #[must_use]
    pub fn derive_local(&self) -> Self {
        Self(format!(
            "{}{LOCAL_TRACK_SEPARATOR}{}",
            self.0,
            uuid::Uuid::new_v4()
        ))
    }

    /// The remote track id a derived local id was built from, if any.
    ///
    /// Only a uuid suffix marks a derived id; `cam::front` is a plain id.
    #[must_use]
    pub fn source_track(&self) -> Option<Self> {
        self.0
            .rsplit_once(LOCAL_TRACK_SEPARATOR)
            .filter(|(_, suffix)| uuid::Uuid::parse_str(suffix).is_ok())
            .map(|(remote, _)| Self(remote.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_local_is_unique() {
        let remote = TrackId::from("video-1");
        let a = remote.derive_local();
        let b = remote.derive_local();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("video-1::"));
        assert_eq!(a.source_track(), Some(remote.clone()));
        assert_eq!(b.source_track(), Some(remote));
    }

    #[test]
    fn test_source_track_of_plain_id() {
        assert_eq!(TrackId::from("audio").source_track(), None);
    }

    #[test]
    fn test_separator_without_uuid_is_not_derived() {
        assert_eq!(TrackId::from("cam::front").source_track(), None);
        assert_eq!(TrackId::from("cam::").source_track(), None);

        let nested = TrackId::from("cam::front").derive_local();
        assert_eq!(nested.source_track(), Some(TrackId::from("cam::front")));
    }

    #[test]
    fn test_ids_serialize_as_plain_strings() {
        let peer = PeerId::from("alice");
        assert_eq!(serde_json::to_string(&peer).unwrap(), "\"alice\"");
        assert_eq!(peer.to_string(), "alice");
        assert_eq!(
            serde_json::from_str::<TrackId>("\"cam\"").unwrap(),
            TrackId::new("cam")
        );
    }
}
