//! Peer connection construction

use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::RelayConfig;
use crate::track::{check_keyframe_interval, DEFAULT_KEYFRAME_INTERVAL};
use crate::Result;

/// Builds peer connections that all share one configuration.
///
/// A forwarding peer keeps its factory so a replacement connection gets the
/// same ICE servers and codecs as the first one. Peers built on a factory
/// also take its keyframe interval.
pub struct ConnectionFactory {
    api: API,
    configuration: RTCConfiguration,
    keyframe_interval: Duration,
}

impl ConnectionFactory {
    /// Build a factory with the default codecs and interceptors
    pub fn new(configuration: RTCConfiguration) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            configuration,
            keyframe_interval: DEFAULT_KEYFRAME_INTERVAL,
        })
    }

    /// Use `interval` between keyframe requests on every relayed track
    pub fn with_keyframe_interval(mut self, interval: Duration) -> Result<Self> {
        self.keyframe_interval = check_keyframe_interval(interval)?;
        Ok(self)
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self> {
        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        info!(
            ice_servers = ice_servers.len(),
            keyframe_interval_secs = config.keyframe_interval_secs,
            "Connection factory configured"
        );

        Self::new(RTCConfiguration {
            ice_servers,
            ..Default::default()
        })?
        .with_keyframe_interval(config.keyframe_interval())
    }

    pub async fn create(&self) -> Result<Arc<RTCPeerConnection>> {
        let connection = self
            .api
            .new_peer_connection(self.configuration.clone())
            .await?;
        Ok(Arc::new(connection))
    }

    #[must_use]
    pub const fn configuration(&self) -> &RTCConfiguration {
        &self.configuration
    }

    #[must_use]
    pub const fn keyframe_interval(&self) -> Duration {
        self.keyframe_interval
    }
}

impl std::fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("ice_servers", &self.configuration.ice_servers.len())
            .field("keyframe_interval", &self.keyframe_interval)
            .finish_non_exhaustive()
    }
}
