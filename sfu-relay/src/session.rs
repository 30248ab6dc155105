//! Signaling glue
//!
//! Connects the pieces that the negotiator and the forwarding peer keep
//! apart:
//! - [`PeerSignaling`] drives a negotiator's operations against a peer's live
//!   connection and an outbound [`SignalSink`]
//! - [`SignalRouter`] dispatches inbound [`SignalMessage`]s to the negotiator
//!   registered for a participant, and owns join/leave bookkeeping

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::events::PeerEventKind;
use crate::negotiator::{NegotiationHandler, Negotiator, NegotiatorConfig};
use crate::peer::ForwardingPeer;
use crate::registry::{NegotiatorRegistry, PeerRegistry};
use crate::types::PeerId;
use crate::{Error, Result};

/// Inbound signaling, as carried by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
}

/// Outbound signaling towards one participant
#[async_trait]
pub trait SignalSink: Send + Sync {
    async fn send_description(&self, peer_id: &PeerId, description: RTCSessionDescription)
        -> Result<()>;
}

/// [`NegotiationHandler`] backed by a forwarding peer's current connection
pub struct PeerSignaling {
    peer: Arc<ForwardingPeer>,
    sink: Arc<dyn SignalSink>,
}

impl PeerSignaling {
    #[must_use]
    pub fn new(peer: Arc<ForwardingPeer>, sink: Arc<dyn SignalSink>) -> Self {
        Self { peer, sink }
    }
}

#[async_trait]
impl NegotiationHandler for PeerSignaling {
    /// Apply a remote description; a remote offer is answered immediately
    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.peer.ensure_active()?;
        let connection = self.peer.connection();
        let is_offer = description.sdp_type == RTCSdpType::Offer;

        connection.set_remote_description(description).await?;
        if !is_offer {
            return Ok(());
        }

        let answer = connection.create_answer(None).await?;
        connection.set_local_description(answer.clone()).await?;
        self.sink.send_description(self.peer.id(), answer).await?;
        debug!(peer_id = %self.peer.id(), "Answer sent");
        Ok(())
    }

    /// An answer to our own outstanding offer belongs on the remote side
    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.peer.ensure_active()?;
        let connection = self.peer.connection();

        if description.sdp_type == RTCSdpType::Answer
            && connection.signaling_state() == RTCSignalingState::HaveLocalOffer
        {
            connection.set_remote_description(description).await?;
        } else {
            connection.set_local_description(description).await?;
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.peer.ensure_active()?;
        self.peer.connection().add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<RTCSessionDescription> {
        self.peer.ensure_active()?;
        Ok(self.peer.connection().create_offer(None).await?)
    }

    async fn send_description(&self, description: RTCSessionDescription) -> Result<()> {
        self.sink.send_description(self.peer.id(), description).await
    }

    /// Return to stable by discarding the pending local offer
    async fn rollback(&self) -> Result<()> {
        self.peer.ensure_active()?;
        let connection = self.peer.connection();
        let pending = connection
            .pending_local_description()
            .await
            .ok_or_else(|| Error::Signaling("no local offer to roll back".to_string()))?;

        // A rollback must carry a parseable SDP; reuse the offer being discarded
        let mut rollback = RTCSessionDescription::default();
        rollback.sdp_type = RTCSdpType::Rollback;
        rollback.sdp = pending.sdp;
        connection.set_local_description(rollback).await?;

        debug!(peer_id = %self.peer.id(), "Local offer rolled back");
        Ok(())
    }
}

/// Create a negotiator for `peer` and wire it to the peer's events.
///
/// Negotiation-needed starts an offer cycle, and a return to the stable
/// signaling state redelivers an offer set aside during a collision. The
/// subscriptions hold the negotiator weakly.
pub fn bind_negotiator(
    peer: &Arc<ForwardingPeer>,
    sink: Arc<dyn SignalSink>,
    polite: bool,
) -> Arc<Negotiator> {
    let negotiator = Arc::new(Negotiator::new(
        NegotiatorConfig {
            id: peer.id().clone(),
            polite,
        },
        Arc::new(PeerSignaling::new(Arc::clone(peer), sink)),
    ));

    let weak: Weak<Negotiator> = Arc::downgrade(&negotiator);
    peer.add_handler(PeerEventKind::NegotiationNeeded, move |_event| {
        let weak = weak.clone();
        async move {
            if let Some(negotiator) = weak.upgrade() {
                // Runs off the connection's callback path
                tokio::spawn(async move { negotiator.send_offer().await });
            }
        }
    });

    let weak: Weak<Negotiator> = Arc::downgrade(&negotiator);
    peer.on_signaling_state_change(move |state| {
        let weak = weak.clone();
        async move {
            if state != RTCSignalingState::Stable {
                return;
            }
            if let Some(negotiator) = weak.upgrade() {
                if negotiator.has_pending_offer() {
                    tokio::spawn(async move {
                        negotiator.redeliver_pending_offer(state).await;
                    });
                }
            }
        }
    });

    negotiator
}

/// Dispatches inbound signaling by participant id
#[derive(Debug, Clone)]
pub struct SignalRouter {
    negotiators: Arc<NegotiatorRegistry>,
    peers: Arc<PeerRegistry>,
}

impl SignalRouter {
    #[must_use]
    pub fn new(negotiators: Arc<NegotiatorRegistry>, peers: Arc<PeerRegistry>) -> Self {
        Self { negotiators, peers }
    }

    #[must_use]
    pub fn negotiators(&self) -> &Arc<NegotiatorRegistry> {
        &self.negotiators
    }

    #[must_use]
    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    /// Register a participant's peer and bind a negotiator to it
    pub fn join(
        &self,
        peer: Arc<ForwardingPeer>,
        sink: Arc<dyn SignalSink>,
        polite: bool,
    ) -> Result<Arc<Negotiator>> {
        let peer = self.peers.add(peer)?;
        let negotiator = bind_negotiator(&peer, sink, polite);
        self.negotiators.add(Arc::clone(&negotiator))?;

        info!(peer_id = %peer.id(), polite, "Participant joined");
        Ok(negotiator)
    }

    /// Unregister a participant and shut its peer down
    pub async fn leave(&self, peer_id: &PeerId) -> Result<()> {
        self.negotiators.remove_by_id(peer_id);
        let peer = self
            .peers
            .remove_by_id(peer_id)
            .ok_or_else(|| Error::NotFound(format!("peer {peer_id} not found")))?;

        peer.shutdown().await?;
        info!(peer_id = %peer_id, "Participant left");
        Ok(())
    }

    /// Deliver one inbound message to the participant's negotiator.
    ///
    /// Messages for one participant must be routed in arrival order. An
    /// unknown participant is logged and the message dropped.
    pub async fn route(&self, peer_id: &PeerId, message: SignalMessage) -> Result<()> {
        let negotiator = self.negotiators.get_by_id(peer_id).inspect_err(|e| {
            warn!(peer_id = %peer_id, error = %e, "Dropping signal for unknown participant");
        })?;

        match message {
            SignalMessage::Offer(offer) => {
                let peer = self.peers.get_by_id(peer_id).inspect_err(|e| {
                    warn!(peer_id = %peer_id, error = %e, "Dropping offer for unknown peer");
                })?;
                negotiator.handle_offer(offer, peer.signaling_state()).await;
                // A polite collision rolls back to stable; apply the set-aside offer now
                negotiator
                    .redeliver_pending_offer(peer.signaling_state())
                    .await;
            }
            SignalMessage::Answer(answer) => negotiator.handle_answer(answer).await,
            SignalMessage::Candidate(candidate) => negotiator.handle_candidate(candidate).await,
        }
        Ok(())
    }
}
