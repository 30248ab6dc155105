//! SFU signaling and relay core
//!
//! Per-participant building blocks of a Selective Forwarding Unit: resolving
//! concurrent renegotiation with perfect negotiation, and relaying each
//! participant's published media to everyone else's peer connection.
//!
//! ## Architecture
//!
//! - **`Negotiator`**: perfect-negotiation state for one participant
//! - **`ForwardingPeer`**: one participant's connection, event fan-out and relays
//! - **`Registry`**: id-keyed lookup for negotiators and peers
//! - **`SignalRouter`**: routes inbound signaling to the right negotiator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_relay::{ConnectionFactory, ForwardingPeer, RelayConfig, SignalMessage, SignalRouter};
//!
//! let config = RelayConfig::load(Some("relay.toml"))?;
//! let factory = Arc::new(ConnectionFactory::from_config(&config)?);
//! let router = SignalRouter::new(Arc::default(), Arc::default());
//!
//! let peer = ForwardingPeer::new("alice", Arc::clone(&factory)).await?;
//! router.join(peer, sink, config.server_polite)?;
//! router.route(&"alice".into(), SignalMessage::Offer(offer)).await?;
//! ```

mod config;
mod connection;
mod error;
mod events;
mod logging;
mod negotiator;
mod peer;
mod registry;
mod session;
mod track;
mod types;

pub use config::{IceServerConfig, LoggingConfig, RelayConfig};
pub use connection::ConnectionFactory;
pub use error::{Error, Result};
pub use events::{EventHandler, EventHub, PeerEvent, PeerEventKind, SubscriptionId};
pub use logging::{init_logging, LOG_ENV};
pub use negotiator::{NegotiationHandler, Negotiator, NegotiatorConfig};
pub use peer::{ForwardingPeer, PeerState};
pub use registry::{DuplicatePolicy, Identified, NegotiatorRegistry, PeerRegistry, Registry};
pub use session::{bind_negotiator, PeerSignaling, SignalMessage, SignalRouter, SignalSink};
pub use track::{KeyframeRequester, RelaySource, DEFAULT_KEYFRAME_INTERVAL};
pub use types::{PeerId, TrackId, LOCAL_TRACK_SEPARATOR};
