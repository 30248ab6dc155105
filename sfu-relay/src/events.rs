//! Peer event fan-out
//!
//! A peer connection accepts exactly one callback per event. [`EventHub`]
//! sits in that slot and forwards every event to any number of subscribers,
//! keyed by event kind and subscription id. Subscriptions live on the hub, so
//! they survive a replacement of the underlying connection.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::trace;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

/// Identifier handed out by [`EventHub::subscribe`]
pub type SubscriptionId = String;

/// Callback invoked for every event of the kind it subscribed to
pub type EventHandler = Arc<dyn Fn(PeerEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Kinds of events a forwarding peer broadcasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerEventKind {
    ConnectionState,
    DataChannel,
    IceCandidate,
    IceConnectionState,
    IceGatheringState,
    NegotiationNeeded,
    SignalingState,
    RemoteTrack,
    LocalTrackCreated,
}

/// An event raised by a peer connection or by the relay
#[derive(Clone)]
pub enum PeerEvent {
    ConnectionState(RTCPeerConnectionState),
    DataChannel(Arc<RTCDataChannel>),
    /// `None` marks the end of candidate gathering
    IceCandidate(Option<RTCIceCandidate>),
    IceConnectionState(RTCIceConnectionState),
    IceGatheringState(RTCIceGathererState),
    NegotiationNeeded,
    SignalingState(RTCSignalingState),
    RemoteTrack {
        track: Arc<TrackRemote>,
        receiver: Arc<RTCRtpReceiver>,
    },
    LocalTrackCreated(Arc<TrackLocalStaticRTP>),
}

impl PeerEvent {
    #[must_use]
    pub const fn kind(&self) -> PeerEventKind {
        match self {
            Self::ConnectionState(_) => PeerEventKind::ConnectionState,
            Self::DataChannel(_) => PeerEventKind::DataChannel,
            Self::IceCandidate(_) => PeerEventKind::IceCandidate,
            Self::IceConnectionState(_) => PeerEventKind::IceConnectionState,
            Self::IceGatheringState(_) => PeerEventKind::IceGatheringState,
            Self::NegotiationNeeded => PeerEventKind::NegotiationNeeded,
            Self::SignalingState(_) => PeerEventKind::SignalingState,
            Self::RemoteTrack { .. } => PeerEventKind::RemoteTrack,
            Self::LocalTrackCreated(_) => PeerEventKind::LocalTrackCreated,
        }
    }
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionState(state) => write!(f, "ConnectionState({state:?})"),
            Self::DataChannel(channel) => write!(f, "DataChannel({})", channel.label()),
            Self::IceCandidate(candidate) => write!(f, "IceCandidate({candidate:?})"),
            Self::IceConnectionState(state) => write!(f, "IceConnectionState({state:?})"),
            Self::IceGatheringState(state) => write!(f, "IceGatheringState({state:?})"),
            Self::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            Self::SignalingState(state) => write!(f, "SignalingState({state:?})"),
            Self::RemoteTrack { track, .. } => write!(f, "RemoteTrack({})", track.id()),
            Self::LocalTrackCreated(track) => {
                use webrtc::track::track_local::TrackLocal;
                write!(f, "LocalTrackCreated({})", track.id())
            }
        }
    }
}

/// Subscription table: event kind -> subscription id -> callback
#[derive(Default)]
pub struct EventHub {
    channels: RwLock<HashMap<PeerEventKind, HashMap<SubscriptionId, EventHandler>>>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async callback for one event kind
    pub fn subscribe<F, Fut>(&self, kind: PeerEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(PeerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| Box::pin(handler(event)));
        self.subscribe_boxed(kind, handler)
    }

    pub fn subscribe_boxed(&self, kind: PeerEventKind, handler: EventHandler) -> SubscriptionId {
        let id = nanoid::nanoid!();
        self.channels
            .write()
            .entry(kind)
            .or_default()
            .insert(id.clone(), handler);
        trace!(kind = ?kind, subscription_id = %id, "Event handler added");
        id
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn unsubscribe(&self, kind: PeerEventKind, id: &str) -> bool {
        let mut channels = self.channels.write();
        let removed = channels
            .get_mut(&kind)
            .and_then(|handlers| handlers.remove(id))
            .is_some();
        if removed {
            trace!(kind = ?kind, subscription_id = %id, "Event handler removed");
        }
        removed
    }

    #[must_use]
    pub fn handler_count(&self, kind: PeerEventKind) -> usize {
        self.channels.read().get(&kind).map_or(0, HashMap::len)
    }

    /// Deliver an event to every subscriber of its kind.
    ///
    /// The handler list is snapshotted first so callbacks may subscribe or
    /// unsubscribe without deadlocking.
    pub async fn emit(&self, event: PeerEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .channels
            .read()
            .get(&kind)
            .map(|handlers| handlers.values().cloned().collect())
            .unwrap_or_default();

        for handler in handlers {
            handler(event.clone()).await;
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels = self.channels.read();
        let counts: HashMap<_, _> = channels.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventHub").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(hub: &EventHub, kind: PeerEventKind) -> (SubscriptionId, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let id = hub.subscribe(kind, move |_event| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (id, calls)
    }

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber_of_kind() {
        let hub = EventHub::new();
        let (_, first) = counting_handler(&hub, PeerEventKind::NegotiationNeeded);
        let (_, second) = counting_handler(&hub, PeerEventKind::NegotiationNeeded);
        let (_, other) = counting_handler(&hub, PeerEventKind::SignalingState);

        hub.emit(PeerEvent::NegotiationNeeded).await;

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let (id, calls) = counting_handler(&hub, PeerEventKind::SignalingState);
        assert_ne!(id, counting_handler(&hub, PeerEventKind::SignalingState).0);

        assert!(hub.unsubscribe(PeerEventKind::SignalingState, &id));
        assert!(!hub.unsubscribe(PeerEventKind::SignalingState, &id));
        assert!(!hub.unsubscribe(PeerEventKind::DataChannel, "missing"));
        assert_eq!(hub.handler_count(PeerEventKind::SignalingState), 1);

        hub.emit(PeerEvent::SignalingState(RTCSignalingState::Stable))
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_can_unsubscribe_itself() {
        let hub = Arc::new(EventHub::new());
        let slot: Arc<parking_lot::Mutex<Option<SubscriptionId>>> = Arc::default();

        let hub_ref = Arc::clone(&hub);
        let slot_ref = Arc::clone(&slot);
        let id = hub.subscribe(PeerEventKind::NegotiationNeeded, move |_event| {
            let hub = Arc::clone(&hub_ref);
            let slot = Arc::clone(&slot_ref);
            async move {
                if let Some(id) = slot.lock().take() {
                    hub.unsubscribe(PeerEventKind::NegotiationNeeded, &id);
                }
            }
        });
        *slot.lock() = Some(id);

        hub.emit(PeerEvent::NegotiationNeeded).await;
        assert_eq!(hub.handler_count(PeerEventKind::NegotiationNeeded), 0);
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(
            PeerEvent::IceCandidate(None).kind(),
            PeerEventKind::IceCandidate
        );
        assert_eq!(
            PeerEvent::ConnectionState(RTCPeerConnectionState::Connected).kind(),
            PeerEventKind::ConnectionState
        );
    }
}
