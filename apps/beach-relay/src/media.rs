//! Media-stack collaborator used by the negotiation state machine.
//!
//! The relay never inspects session descriptions or candidates itself. It
//! hands them to a [`MediaPeer`], one per connection, and carries back
//! whatever answer the peer produces.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaError;

const STREAM_ID: &str = "beach-relay";

/// Which side of the offer/answer exchange a description belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[async_trait]
pub trait MediaPeer: Send + Sync {
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;

    /// Produce a local answer for the current remote offer. `None` means this
    /// peer never answers and the offer is only relayed.
    async fn create_answer(&self) -> Result<Option<String>, MediaError>;

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError>;

    async fn close(&self) -> Result<(), MediaError>;
}

/// Builds one [`MediaPeer`] per accepted connection.
#[async_trait]
pub trait MediaPeerFactory: Send + Sync {
    async fn create_peer(&self) -> Result<Box<dyn MediaPeer>, MediaError>;
}

pub type SharedPeerFactory = Arc<dyn MediaPeerFactory>;

/// Answers offers with a server-side `webrtc` peer connection that publishes
/// an Opus audio track and a VP8 video track.
pub struct WebRtcPeerFactory {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaPeerFactory for WebRtcPeerFactory {
    async fn create_peer(&self) -> Result<Box<dyn MediaPeer>, MediaError> {
        let pc = self
            .api
            .new_peer_connection(self.configuration())
            .await
            .map_err(|e| MediaError::call("new_peer_connection", e))?;

        for (mime_type, track_id) in [(MIME_TYPE_OPUS, "audio"), (MIME_TYPE_VP8, "video")] {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track_id.to_owned(),
                STREAM_ID.to_owned(),
            ));
            pc.add_track(track as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| MediaError::call("add_track", e))?;
        }

        Ok(Box::new(WebRtcPeer { pc }))
    }
}

struct WebRtcPeer {
    pc: RTCPeerConnection,
}

fn description(kind: SdpKind, sdp: &str) -> Result<RTCSessionDescription, MediaError> {
    let parsed = match kind {
        SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
        SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
    };
    parsed.map_err(|e| MediaError::call("parse_description", e))
}

#[async_trait]
impl MediaPeer for WebRtcPeer {
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        let desc = description(kind, sdp)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| MediaError::call("set_remote_description", e))
    }

    async fn create_answer(&self) -> Result<Option<String>, MediaError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| MediaError::call("create_answer", e))?;
        Ok(Some(answer.sdp))
    }

    async fn set_local_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        let desc = description(kind, sdp)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| MediaError::call("set_local_description", e))
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.to_owned(),
                ..Default::default()
            })
            .await
            .map_err(|e| MediaError::call("add_ice_candidate", e))
    }

    async fn close(&self) -> Result<(), MediaError> {
        self.pc
            .close()
            .await
            .map_err(|e| MediaError::call("close", e))
    }
}

/// Pure relay: accepts every description and candidate, never answers.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayOnlyFactory;

#[async_trait]
impl MediaPeerFactory for RelayOnlyFactory {
    async fn create_peer(&self) -> Result<Box<dyn MediaPeer>, MediaError> {
        Ok(Box::new(RelayOnlyPeer))
    }
}

struct RelayOnlyPeer;

#[async_trait]
impl MediaPeer for RelayOnlyPeer {
    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<(), MediaError> {
        debug!("relay-only peer noted remote {:?} ({} bytes)", kind, sdp.len());
        Ok(())
    }

    async fn create_answer(&self) -> Result<Option<String>, MediaError> {
        Ok(None)
    }

    async fn set_local_description(&self, _kind: SdpKind, _sdp: &str) -> Result<(), MediaError> {
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: &str) -> Result<(), MediaError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), MediaError> {
        Ok(())
    }
}
