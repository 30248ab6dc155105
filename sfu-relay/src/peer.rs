//! Forwarding peer lifecycle
//!
//! This module handles:
//! - Ownership of one participant's peer connection
//! - Fan-out of connection events to any number of subscribers
//! - Connection replacement that keeps subscriptions intact
//! - Shutdown, which tears down every relay before closing the connection
//!
//! Track relaying lives in [`crate::track`].

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::ConnectionFactory;
use crate::events::{EventHub, PeerEvent, PeerEventKind, SubscriptionId};
use crate::registry::Identified;
use crate::track::check_keyframe_interval;
use crate::types::{PeerId, TrackId};
use crate::{Error, Result};

/// Lifecycle state of a forwarding peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Active,
    Closing,
}

/// Relay bookkeeping, guarded as one unit
#[derive(Default)]
pub(crate) struct RelayTracks {
    /// remote track id -> local track id
    pub(crate) track_map: HashMap<TrackId, TrackId>,
    /// local track id -> relayed track
    pub(crate) local_tracks: HashMap<TrackId, Arc<TrackLocalStaticRTP>>,
}

/// One participant's connection plus the tracks relayed out of it
pub struct ForwardingPeer {
    id: PeerId,
    factory: Arc<ConnectionFactory>,
    connection: RwLock<Arc<RTCPeerConnection>>,
    /// Bumped on every replacement; events from older connections are dropped
    generation: Arc<AtomicU64>,
    /// Shared with relay tasks, which stop once it is set
    pub(crate) closing: Arc<AtomicBool>,
    pub(crate) tracks: Mutex<RelayTracks>,
    events: Arc<EventHub>,
    pub(crate) keyframe_interval: Duration,
}

impl ForwardingPeer {
    /// Create a peer around a fresh connection, using the factory's keyframe interval
    pub async fn new(id: impl Into<PeerId>, factory: Arc<ConnectionFactory>) -> Result<Arc<Self>> {
        let keyframe_interval = factory.keyframe_interval();
        Self::with_keyframe_interval(id, factory, keyframe_interval).await
    }

    /// Create a peer that requests keyframes every `keyframe_interval`; zero is rejected
    pub async fn with_keyframe_interval(
        id: impl Into<PeerId>,
        factory: Arc<ConnectionFactory>,
        keyframe_interval: Duration,
    ) -> Result<Arc<Self>> {
        let id = id.into();
        let keyframe_interval = check_keyframe_interval(keyframe_interval)?;
        let connection = factory.create().await?;

        let peer = Arc::new(Self {
            id,
            factory,
            connection: RwLock::new(Arc::clone(&connection)),
            generation: Arc::new(AtomicU64::new(0)),
            closing: Arc::new(AtomicBool::new(false)),
            tracks: Mutex::new(RelayTracks::default()),
            events: Arc::new(EventHub::new()),
            keyframe_interval,
        });
        peer.bind_events(&connection, 0);

        info!(peer_id = %peer.id, "Forwarding peer created");
        Ok(peer)
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        if self.is_closing() {
            PeerState::Closing
        } else {
            PeerState::Active
        }
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_closing() {
            Err(Error::PeerClosing(self.id.clone()))
        } else {
            Ok(())
        }
    }

    /// The current underlying connection
    #[must_use]
    pub fn connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.connection.read())
    }

    #[must_use]
    pub fn signaling_state(&self) -> RTCSignalingState {
        self.connection.read().signaling_state()
    }

    #[must_use]
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Route every connection callback into the event hub
    fn bind_events(&self, connection: &RTCPeerConnection, generation: u64) {
        let forward = {
            let hub = Arc::clone(&self.events);
            let current = Arc::clone(&self.generation);
            move |event: PeerEvent| -> BoxFuture<'static, ()> {
                let hub = Arc::clone(&hub);
                let stale = current.load(Ordering::Acquire) != generation;
                Box::pin(async move {
                    if stale {
                        return;
                    }
                    hub.emit(event).await;
                })
            }
        };

        let f = forward.clone();
        connection.on_peer_connection_state_change(Box::new(move |state| {
            f(PeerEvent::ConnectionState(state))
        }));

        let f = forward.clone();
        connection.on_data_channel(Box::new(move |channel| f(PeerEvent::DataChannel(channel))));

        let f = forward.clone();
        connection.on_ice_candidate(Box::new(move |candidate| {
            f(PeerEvent::IceCandidate(candidate))
        }));

        let f = forward.clone();
        connection.on_ice_connection_state_change(Box::new(move |state| {
            f(PeerEvent::IceConnectionState(state))
        }));

        let f = forward.clone();
        connection.on_ice_gathering_state_change(Box::new(move |state| {
            f(PeerEvent::IceGatheringState(state))
        }));

        let f = forward.clone();
        connection.on_negotiation_needed(Box::new(move || f(PeerEvent::NegotiationNeeded)));

        let f = forward.clone();
        connection.on_signaling_state_change(Box::new(move |state| {
            f(PeerEvent::SignalingState(state))
        }));

        let f = forward;
        connection.on_track(Box::new(move |track, receiver, _transceiver| {
            f(PeerEvent::RemoteTrack { track, receiver })
        }));
    }

    /// Swap in a new connection built from the same configuration.
    ///
    /// Subscriptions stay registered. The previous connection is closed and
    /// its late events are no longer delivered.
    pub async fn recreate_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        self.ensure_active()?;

        let connection = self.factory.create().await?;
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.bind_events(&connection, generation);

        let previous = std::mem::replace(&mut *self.connection.write(), Arc::clone(&connection));
        if let Err(e) = previous.close().await {
            debug!(peer_id = %self.id, error = %e, "Failed to close replaced connection");
        }

        info!(peer_id = %self.id, generation, "Peer connection recreated");
        Ok(connection)
    }

    /// Subscribe to one event kind
    pub fn add_handler<F, Fut>(&self, kind: PeerEventKind, handler: F) -> SubscriptionId
    where
        F: Fn(PeerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.events.subscribe(kind, handler)
    }

    /// Remove a subscription. Unknown ids are ignored.
    pub fn remove_handler(&self, kind: PeerEventKind, id: &str) -> bool {
        self.events.unsubscribe(kind, id)
    }

    pub fn on_remote_track<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<TrackRemote>, Arc<RTCRtpReceiver>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_handler(PeerEventKind::RemoteTrack, move |event| {
            let call = match event {
                PeerEvent::RemoteTrack { track, receiver } => Some(handler(track, receiver)),
                _ => None,
            };
            async move {
                if let Some(call) = call {
                    call.await;
                }
            }
        })
    }

    pub fn on_local_track_created<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<TrackLocalStaticRTP>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_handler(PeerEventKind::LocalTrackCreated, move |event| {
            let call = match event {
                PeerEvent::LocalTrackCreated(track) => Some(handler(track)),
                _ => None,
            };
            async move {
                if let Some(call) = call {
                    call.await;
                }
            }
        })
    }

    pub fn on_ice_candidate<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Option<RTCIceCandidate>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_handler(PeerEventKind::IceCandidate, move |event| {
            let call = match event {
                PeerEvent::IceCandidate(candidate) => Some(handler(candidate)),
                _ => None,
            };
            async move {
                if let Some(call) = call {
                    call.await;
                }
            }
        })
    }

    pub fn on_signaling_state_change<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(RTCSignalingState) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_handler(PeerEventKind::SignalingState, move |event| {
            let call = match event {
                PeerEvent::SignalingState(state) => Some(handler(state)),
                _ => None,
            };
            async move {
                if let Some(call) = call {
                    call.await;
                }
            }
        })
    }

    /// Stop relaying and close the connection.
    ///
    /// Only the first call does anything; later calls return `Ok`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!(peer_id = %self.id, "Peer already shutting down");
            return Ok(());
        }

        let remote_ids: Vec<TrackId> = self.tracks.lock().track_map.keys().cloned().collect();
        for remote_id in &remote_ids {
            self.remove_local_track(remote_id);
        }

        self.connection().close().await?;

        info!(
            peer_id = %self.id,
            relays_removed = remote_ids.len(),
            "Forwarding peer shut down"
        );
        Ok(())
    }
}

impl Identified for ForwardingPeer {
    fn id(&self) -> &PeerId {
        &self.id
    }
}

impl std::fmt::Debug for ForwardingPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingPeer")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("relayed_tracks", &self.tracks.lock().track_map.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::PeerRegistry;
    use tokio::sync::mpsc;
    use webrtc::api::media_engine::MIME_TYPE_VP8;
    use webrtc::peer_connection::configuration::RTCConfiguration;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    pub(crate) fn factory() -> Arc<ConnectionFactory> {
        Arc::new(ConnectionFactory::new(RTCConfiguration::default()).unwrap())
    }

    pub(crate) fn video_track(id: &str, stream_id: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        ))
    }

    #[tokio::test]
    async fn test_new_peer_is_active() {
        let peer = ForwardingPeer::new("1", factory()).await.unwrap();
        assert_eq!(peer.id(), &PeerId::from("1"));
        assert_eq!(peer.state(), PeerState::Active);
        assert_eq!(peer.signaling_state(), RTCSignalingState::Stable);
        peer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_takes_factory_keyframe_interval() {
        let factory = ConnectionFactory::new(RTCConfiguration::default())
            .unwrap()
            .with_keyframe_interval(Duration::from_secs(9))
            .unwrap();
        let peer = ForwardingPeer::new("1", Arc::new(factory)).await.unwrap();
        assert_eq!(peer.keyframe_interval, Duration::from_secs(9));
        peer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_keyframe_interval_is_rejected() {
        let err = ForwardingPeer::with_keyframe_interval("1", factory(), Duration::ZERO)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));

        let err = ConnectionFactory::new(RTCConfiguration::default())
            .unwrap()
            .with_keyframe_interval(Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_shutdown_twice_is_harmless() {
        let peer = ForwardingPeer::new("1", factory()).await.unwrap();
        peer.shutdown().await.unwrap();
        peer.shutdown().await.unwrap();
        assert_eq!(peer.state(), PeerState::Closing);
    }

    #[tokio::test]
    async fn test_handler_ids_are_unique_and_removable() {
        let peer = ForwardingPeer::new("1", factory()).await.unwrap();
        let a = peer.on_ice_candidate(|_| async {});
        let b = peer.on_ice_candidate(|_| async {});
        assert_ne!(a, b);
        assert_eq!(peer.events().handler_count(PeerEventKind::IceCandidate), 2);

        assert!(peer.remove_handler(PeerEventKind::IceCandidate, &a));
        assert!(!peer.remove_handler(PeerEventKind::IceCandidate, &a));
        assert!(!peer.remove_handler(PeerEventKind::RemoteTrack, &b));
        assert_eq!(peer.events().handler_count(PeerEventKind::IceCandidate), 1);
        peer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_events_reach_subscribers() {
        let peer = ForwardingPeer::new("1", factory()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.add_handler(PeerEventKind::NegotiationNeeded, move |_event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });

        peer.add_peer_track(video_track("video", "2")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("negotiation-needed not delivered")
            .unwrap();
        peer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recreate_keeps_subscriptions() {
        let peer = ForwardingPeer::new("1", factory()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.add_handler(PeerEventKind::NegotiationNeeded, move |_event| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
            }
        });

        let before = peer.connection();
        let after = peer.recreate_connection().await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(Arc::ptr_eq(&after, &peer.connection()));

        peer.add_peer_track(video_track("video", "2")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("negotiation-needed not delivered after recreate")
            .unwrap();
        peer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_recreate_after_shutdown_fails() {
        let peer = ForwardingPeer::new("1", factory()).await.unwrap();
        peer.shutdown().await.unwrap();
        let err = peer.recreate_connection().await.unwrap_err();
        assert!(err.is_lifecycle());
    }

    #[tokio::test]
    async fn test_peer_registry_rejects_duplicate_ids() {
        let factory = factory();
        let registry = PeerRegistry::new();
        let first = ForwardingPeer::new("1", Arc::clone(&factory)).await.unwrap();
        let second = ForwardingPeer::new("1", Arc::clone(&factory)).await.unwrap();

        let added = registry.add(Arc::clone(&first)).unwrap();
        assert!(Arc::ptr_eq(&added, &first));
        assert!(matches!(
            registry.add(Arc::clone(&second)),
            Err(Error::AlreadyExists(_))
        ));
        assert_eq!(registry.count(), 1);

        let found = registry.get_by_id(&PeerId::from("1")).unwrap();
        assert_eq!(found.id(), first.id());
        assert!(registry.remove(&first));
        assert_eq!(registry.count(), 0);

        first.shutdown().await.unwrap();
        second.shutdown().await.unwrap();
    }
}
