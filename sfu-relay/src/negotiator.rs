//! Perfect negotiation
//!
//! Each participant gets one [`Negotiator`]. When both ends want to
//! renegotiate at the same moment their offers collide; the negotiator resolves
//! that deterministically by role:
//!
//! - **impolite**: ignores the incoming offer, its own offer wins
//! - **polite**: abandons its own offer, rolls back a local offer already
//!   applied, and sets the incoming one aside for redelivery once stable
//!
//! Negotiation failures are logged and never returned to the caller. The
//! `making_offer` flag is cleared whenever an offer cycle resolves, so a later
//! cycle can always start again. An abandoned cycle never applies or sends its
//! offer.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;

use crate::registry::Identified;
use crate::types::PeerId;
use crate::Result;

/// Operations a negotiator drives on the connection and the signaling channel
#[async_trait]
pub trait NegotiationHandler: Send + Sync {
    async fn set_remote_description(&self, description: RTCSessionDescription) -> Result<()>;

    async fn set_local_description(&self, description: RTCSessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()>;

    async fn create_offer(&self) -> Result<RTCSessionDescription>;

    /// Discard a local offer that was applied but never answered
    async fn rollback(&self) -> Result<()>;

    /// Hand a description to the signaling transport for the remote party
    async fn send_description(&self, description: RTCSessionDescription) -> Result<()>;
}

/// Creation parameters for a [`Negotiator`]
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub id: PeerId,
    pub polite: bool,
}

pub struct Negotiator {
    id: PeerId,
    polite: bool,
    making_offer: Mutex<bool>,
    /// Bumped when a polite negotiator abandons the in-flight offer cycle
    offer_cycle: AtomicU64,
    /// Offer set aside by a polite negotiator on collision
    pending_offer: Mutex<Option<RTCSessionDescription>>,
    handler: Arc<dyn NegotiationHandler>,
}

impl Negotiator {
    #[must_use]
    pub fn new(config: NegotiatorConfig, handler: Arc<dyn NegotiationHandler>) -> Self {
        Self {
            id: config.id,
            polite: config.polite,
            making_offer: Mutex::new(false),
            offer_cycle: AtomicU64::new(0),
            pending_offer: Mutex::new(None),
            handler,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn is_polite(&self) -> bool {
        self.polite
    }

    #[must_use]
    pub fn is_making_offer(&self) -> bool {
        *self.making_offer.lock()
    }

    #[must_use]
    pub fn has_pending_offer(&self) -> bool {
        self.pending_offer.lock().is_some()
    }

    fn set_making_offer(&self, value: bool) {
        *self.making_offer.lock() = value;
    }

    /// Create an offer, apply it locally and send it to the remote party.
    ///
    /// A call made while another offer cycle is in flight does nothing.
    pub async fn send_offer(&self) {
        let cycle = {
            let mut making_offer = self.making_offer.lock();
            if *making_offer {
                debug!(peer_id = %self.id, "Already making offer");
                return;
            }
            *making_offer = true;
            self.offer_cycle.load(Ordering::Acquire)
        };

        self.run_offer_cycle(cycle).await;

        // An abandoned cycle already cleared the flag; a newer one may own it now
        let mut making_offer = self.making_offer.lock();
        if !self.is_abandoned(cycle) {
            *making_offer = false;
        }
    }

    fn is_abandoned(&self, cycle: u64) -> bool {
        self.offer_cycle.load(Ordering::Acquire) != cycle
    }

    async fn run_offer_cycle(&self, cycle: u64) {
        let offer = match self.handler.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!(peer_id = %self.id, error = %e, "Failed to create offer");
                return;
            }
        };

        if self.is_abandoned(cycle) {
            debug!(peer_id = %self.id, "Offer abandoned before it was applied");
            return;
        }

        if let Err(e) = self.handler.set_local_description(offer.clone()).await {
            warn!(peer_id = %self.id, error = %e, "Failed to set local description");
            return;
        }

        if self.is_abandoned(cycle) {
            // Applied after the collision was handled; nothing else will undo it
            debug!(peer_id = %self.id, "Offer abandoned before it was sent");
            if let Err(e) = self.handler.rollback().await {
                warn!(peer_id = %self.id, error = %e, "Failed to roll back abandoned offer");
            }
            return;
        }

        if let Err(e) = self.handler.send_description(offer).await {
            warn!(peer_id = %self.id, error = %e, "Failed to send offer");
            return;
        }

        debug!(peer_id = %self.id, "Offer sent");
    }

    /// Handle an offer from the remote party.
    ///
    /// `signaling_state` is the connection's state at the time of delivery.
    pub async fn handle_offer(
        &self,
        offer: RTCSessionDescription,
        signaling_state: RTCSignalingState,
    ) {
        let offer_collision = {
            let mut making_offer = self.making_offer.lock();
            let collision = *making_offer || signaling_state != RTCSignalingState::Stable;

            if collision && !self.polite {
                drop(making_offer);
                info!(
                    peer_id = %self.id,
                    signaling_state = ?signaling_state,
                    "Ignoring colliding offer (impolite peer)"
                );
                return;
            }

            if collision {
                *making_offer = false;
                self.offer_cycle.fetch_add(1, Ordering::AcqRel);
            }
            collision
        };

        if offer_collision {
            info!(
                peer_id = %self.id,
                signaling_state = ?signaling_state,
                "Offer collision: polite peer abandoned its own offer"
            );
            *self.pending_offer.lock() = Some(offer);

            if signaling_state == RTCSignalingState::HaveLocalOffer {
                if let Err(e) = self.handler.rollback().await {
                    warn!(peer_id = %self.id, error = %e, "Failed to roll back local offer");
                }
            }
            return;
        }

        if let Err(e) = self.handler.set_remote_description(offer).await {
            warn!(peer_id = %self.id, error = %e, "Failed to set remote description");
        }
    }

    /// Re-run an offer set aside during a collision.
    ///
    /// Does nothing unless an offer is pending and the connection is back in
    /// the stable state. Returns whether an offer was redelivered.
    pub async fn redeliver_pending_offer(&self, signaling_state: RTCSignalingState) -> bool {
        if signaling_state != RTCSignalingState::Stable {
            return false;
        }
        let Some(offer) = self.pending_offer.lock().take() else {
            return false;
        };

        debug!(peer_id = %self.id, "Redelivering pending offer");
        self.handle_offer(offer, signaling_state).await;
        true
    }

    /// Handle the answer to an offer made by this side
    pub async fn handle_answer(&self, answer: RTCSessionDescription) {
        if let Err(e) = self.handler.set_local_description(answer).await {
            warn!(peer_id = %self.id, error = %e, "Failed to apply answer");
            self.set_making_offer(false);
        }
    }

    /// Handle an ICE candidate from the remote party.
    ///
    /// A lost candidate only narrows connectivity checks, so failure is not fatal.
    pub async fn handle_candidate(&self, candidate: RTCIceCandidateInit) {
        if let Err(e) = self.handler.add_ice_candidate(candidate).await {
            warn!(peer_id = %self.id, error = %e, "Failed to add ICE candidate");
        }
    }
}

impl Identified for Negotiator {
    fn id(&self) -> &PeerId {
        &self.id
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("id", &self.id)
            .field("polite", &self.polite)
            .field("making_offer", &self.is_making_offer())
            .finish_non_exhaustive()
    }
}
