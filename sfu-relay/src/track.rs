//! Track relaying
//!
//! A remote track received from one participant is re-published as a local
//! track that other participants' peers can send. Each relay runs two tasks:
//! a copy loop that moves RTP packets unmodified from the remote track to the
//! local one, and a keyframe loop that periodically asks the sender for a
//! fresh keyframe so late joiners can start decoding.
//!
//! Both tasks stop once the owning peer starts closing.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::events::PeerEvent;
use crate::peer::ForwardingPeer;
use crate::types::TrackId;
use crate::{Error, Result};

/// How often a relay asks the publisher for a keyframe
pub const DEFAULT_KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// Reject an interval that would spin the keyframe loop
pub(crate) fn check_keyframe_interval(interval: Duration) -> Result<Duration> {
    if interval.is_zero() {
        return Err(Error::Config(config::ConfigError::Message(
            "keyframe interval must be greater than zero".to_string(),
        )));
    }
    Ok(interval)
}

fn owns_track(mine: &[TrackId], track_id: &TrackId) -> bool {
    mine.contains(track_id)
        || track_id
            .source_track()
            .is_some_and(|source| mine.contains(&source))
}

/// The inbound side of a relay
#[async_trait]
pub trait RelaySource: Send + Sync {
    fn track_id(&self) -> TrackId;

    fn media_ssrc(&self) -> u32;

    fn codec_capability(&self) -> RTCRtpCodecCapability;

    /// Block until the next RTP packet arrives
    async fn read_packet(&self) -> Result<Packet>;
}

#[async_trait]
impl RelaySource for TrackRemote {
    fn track_id(&self) -> TrackId {
        TrackId::from(self.id())
    }

    fn media_ssrc(&self) -> u32 {
        self.ssrc()
    }

    fn codec_capability(&self) -> RTCRtpCodecCapability {
        self.codec().capability
    }

    async fn read_packet(&self) -> Result<Packet> {
        let (packet, _attributes) = self.read_rtp().await?;
        Ok(packet)
    }
}

/// Sends keyframe requests back towards a publisher
#[async_trait]
pub trait KeyframeRequester: Send + Sync {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()>;
}

#[async_trait]
impl KeyframeRequester for RTCPeerConnection {
    async fn request_keyframe(&self, media_ssrc: u32) -> Result<()> {
        self.write_rtcp(&[Box::new(PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        })])
        .await?;
        Ok(())
    }
}

/// Forward packets until closing is observed or either side fails.
///
/// Returns the number of packets forwarded.
pub(crate) async fn copy_packets(
    source: Arc<dyn RelaySource>,
    local: Arc<TrackLocalStaticRTP>,
    closing: Arc<AtomicBool>,
) -> u64 {
    let remote_id = source.track_id();
    let mut forwarded = 0u64;

    loop {
        if closing.load(Ordering::Acquire) {
            break;
        }

        let packet = match source.read_packet().await {
            Ok(packet) => packet,
            Err(e) => {
                warn!(
                    remote_track = %remote_id,
                    error = %e,
                    "Failed to read RTP packet"
                );
                break;
            }
        };

        // The peer may have started closing while we were blocked on the read
        if closing.load(Ordering::Acquire) {
            break;
        }

        if let Err(e) = local.write_rtp(&packet).await {
            error!(
                remote_track = %remote_id,
                local_track = %local.id(),
                error = %e,
                "Failed to write RTP packet"
            );
            break;
        }
        forwarded += 1;
    }

    debug!(
        remote_track = %remote_id,
        local_track = %local.id(),
        forwarded,
        "Relay copy loop stopped"
    );
    forwarded
}

/// Request a keyframe every `interval` until closing is observed or a request
/// fails. Returns the number of requests sent.
pub(crate) async fn request_keyframes(
    requester: Arc<dyn KeyframeRequester>,
    media_ssrc: u32,
    interval: Duration,
    closing: Arc<AtomicBool>,
) -> u64 {
    let mut sent = 0u64;

    loop {
        tokio::time::sleep(interval).await;
        if closing.load(Ordering::Acquire) {
            break;
        }

        if let Err(e) = requester.request_keyframe(media_ssrc).await {
            warn!(media_ssrc, error = %e, "Failed to request keyframe");
            break;
        }
        sent += 1;
    }

    debug!(media_ssrc, sent, "Keyframe loop stopped");
    sent
}

impl ForwardingPeer {
    /// Ids of the tracks this peer receives from its participant
    pub async fn my_track_ids(&self) -> Vec<TrackId> {
        let mut ids = Vec::new();
        for receiver in self.connection().get_receivers().await {
            for track in receiver.tracks().await {
                ids.push(TrackId::from(track.id()));
            }
        }
        ids
    }

    /// Whether a track was published by this peer's participant, either
    /// directly or as a local track relayed from one of theirs
    pub async fn is_my_track(&self, track_id: &TrackId) -> bool {
        owns_track(&self.my_track_ids().await, track_id)
    }

    /// Ids of the tracks this peer currently sends to its participant
    pub async fn sending_track_ids(&self) -> Vec<TrackId> {
        let mut ids = Vec::new();
        for sender in self.connection().get_senders().await {
            if let Some(track) = sender.track().await {
                ids.push(TrackId::from(track.id()));
            }
        }
        ids
    }

    pub async fn is_already_sending_track(&self, track_id: &TrackId) -> bool {
        self.sending_track(track_id).await.is_some()
    }

    /// The sender carrying a track, if this peer sends it
    pub async fn sending_track(&self, track_id: &TrackId) -> Option<Arc<RTCRtpSender>> {
        for sender in self.connection().get_senders().await {
            if let Some(track) = sender.track().await {
                if track.id() == track_id.as_str() {
                    return Some(sender);
                }
            }
        }
        None
    }

    #[must_use]
    pub fn local_track_id_for(&self, remote_id: &TrackId) -> Option<TrackId> {
        self.tracks.lock().track_map.get(remote_id).cloned()
    }

    #[must_use]
    pub fn local_track(&self, local_id: &TrackId) -> Option<Arc<TrackLocalStaticRTP>> {
        self.tracks.lock().local_tracks.get(local_id).cloned()
    }

    #[must_use]
    pub fn relayed_track_count(&self) -> usize {
        self.tracks.lock().track_map.len()
    }

    /// Re-publish one of this peer's received tracks as a local track.
    ///
    /// The local track gets a fresh `<remote-id>::<uuid>` id and the peer id
    /// as its stream id. Nothing is registered if the call fails.
    pub async fn convert_remote_track_to_local_track<S>(
        &self,
        remote: Arc<S>,
    ) -> Result<Arc<TrackLocalStaticRTP>>
    where
        S: RelaySource + 'static,
    {
        self.ensure_active()?;

        let remote_id = remote.track_id();
        if !self.my_track_ids().await.contains(&remote_id) {
            return Err(Error::TrackNotOwned(remote_id));
        }

        let requester: Arc<dyn KeyframeRequester> = self.connection();
        self.start_relay(remote, requester).await
    }

    /// Register a relay for `source` and spawn its copy and keyframe tasks
    pub(crate) async fn start_relay(
        &self,
        source: Arc<dyn RelaySource>,
        requester: Arc<dyn KeyframeRequester>,
    ) -> Result<Arc<TrackLocalStaticRTP>> {
        let remote_id = source.track_id();
        let local_id = remote_id.derive_local();

        let mut capability = source.codec_capability();
        capability.rtcp_feedback = Vec::new();
        let local = Arc::new(TrackLocalStaticRTP::new(
            capability,
            local_id.to_string(),
            self.id().to_string(),
        ));

        {
            let mut tracks = self.tracks.lock();
            self.ensure_active()?;
            if tracks.track_map.contains_key(&remote_id) {
                return Err(Error::AlreadyRelaying(remote_id));
            }
            tracks.track_map.insert(remote_id.clone(), local_id.clone());
            tracks
                .local_tracks
                .insert(local_id.clone(), Arc::clone(&local));
        }

        tokio::spawn(copy_packets(
            Arc::clone(&source),
            Arc::clone(&local),
            Arc::clone(&self.closing),
        ));
        tokio::spawn(request_keyframes(
            requester,
            source.media_ssrc(),
            self.keyframe_interval,
            Arc::clone(&self.closing),
        ));

        info!(
            peer_id = %self.id(),
            remote_track = %remote_id,
            local_track = %local_id,
            "Relaying remote track"
        );

        self.events()
            .emit(PeerEvent::LocalTrackCreated(Arc::clone(&local)))
            .await;
        Ok(local)
    }

    /// Forget the relay for a remote track. Running tasks are left alone;
    /// they stop with the peer.
    pub fn remove_local_track(&self, remote_id: &TrackId) -> Option<Arc<TrackLocalStaticRTP>> {
        let mut tracks = self.tracks.lock();
        let local_id = tracks.track_map.remove(remote_id)?;
        let removed = tracks.local_tracks.remove(&local_id);
        debug!(
            peer_id = %self.id(),
            remote_track = %remote_id,
            local_track = %local_id,
            "Relay removed"
        );
        removed
    }

    /// Start sending another participant's track to this peer
    pub async fn add_peer_track(&self, track: Arc<TrackLocalStaticRTP>) -> Result<Arc<RTCRtpSender>> {
        self.ensure_active()?;

        let track_id = TrackId::from(track.id());
        if self.is_my_track(&track_id).await {
            return Err(Error::OwnTrack(track_id));
        }
        if self.is_already_sending_track(&track_id).await {
            return Err(Error::AlreadySending(track_id));
        }

        let sender = self
            .connection()
            .add_track(track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        info!(peer_id = %self.id(), track_id = %track_id, "Sending track");
        Ok(sender)
    }

    pub async fn remove_track(&self, track: &TrackLocalStaticRTP) -> Result<()> {
        self.remove_sending_track(&TrackId::from(track.id())).await
    }

    /// Stop sending a track by id
    pub async fn remove_sending_track(&self, track_id: &TrackId) -> Result<()> {
        self.ensure_active()?;

        if self.is_my_track(track_id).await {
            return Err(Error::OwnTrack(track_id.clone()));
        }
        let sender = self
            .sending_track(track_id)
            .await
            .ok_or_else(|| Error::NotSending(track_id.clone()))?;

        self.connection().remove_track(&sender).await?;

        info!(peer_id = %self.id(), track_id = %track_id, "Stopped sending track");
        Ok(())
    }
}
