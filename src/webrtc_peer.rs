//! [`PeerTransport`] backed by the `webrtc` crate.
//!
//! Descriptions travel as JSON-serialized `RTCSessionDescription`s and
//! candidates as JSON-serialized `RTCIceCandidateInit`s, the same shapes a
//! browser peer produces.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use callcore::{PeerEvent, PeerSessionId, PeerTransport};
use log::{debug, info, warn};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub struct WebRtcPeer {
    ice_servers: Vec<String>,
    connection: Mutex<Option<Arc<RTCPeerConnection>>>,
    /// Session the next events are tagged with; `close()` advances it.
    session: AtomicU64,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl WebRtcPeer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        Self::with_ice_servers(vec![DEFAULT_STUN_SERVER.to_string()])
    }

    pub fn with_ice_servers(
        ice_servers: Vec<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            ice_servers,
            connection: Mutex::new(None),
            session: AtomicU64::new(0),
            events,
        });
        (peer, rx)
    }

    /// The live connection, building a fresh one if the last was closed.
    async fn connection(&self) -> Result<Arc<RTCPeerConnection>, anyhow::Error> {
        let mut slot = self.connection.lock().await;
        if let Some(pc) = slot.as_ref() {
            return Ok(pc.clone());
        }
        let pc = self.build_connection().await?;
        *slot = Some(pc.clone());
        Ok(pc)
    }

    async fn existing_connection(&self) -> Result<Arc<RTCPeerConnection>, anyhow::Error> {
        self.connection
            .lock()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no peer connection"))
    }

    async fn build_connection(&self) -> Result<Arc<RTCPeerConnection>, anyhow::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await?);

        pc.add_transceiver_from_kind(RTPCodecType::Audio, None)
            .await?;
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await?;

        let session = self.current_session();

        let events = self.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(target: "Peer", "ICE gathering complete");
                    return;
                };
                match candidate
                    .to_json()
                    .map_err(anyhow::Error::from)
                    .and_then(|init| serde_json::to_string(&init).map_err(Into::into))
                {
                    Ok(json) => {
                        let _ = events.send(PeerEvent::LocalIceCandidate {
                            session,
                            candidate: json,
                        });
                    }
                    Err(e) => warn!(target: "Peer", "Could not serialize local candidate: {e}"),
                }
            })
        }));

        let events = self.events.clone();
        let media_seen = Arc::new(AtomicBool::new(false));
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            if !media_seen.swap(true, Ordering::SeqCst) {
                info!(target: "Peer", "Remote {} track started", track.kind());
                let _ = events.send(PeerEvent::RemoteMediaAvailable { session });
            }
            Box::pin(async {})
        }));

        let events = self.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(target: "Peer", "Peer connection state changed to {state}");
            if state == RTCPeerConnectionState::Failed {
                warn!(target: "Peer", "Peer connection failed");
                let _ = events.send(PeerEvent::ConnectionClosed { session });
            }
            Box::pin(async {})
        }));

        info!(target: "Peer", "Created peer connection for session {session}");
        Ok(pc)
    }

    async fn local_description_json(pc: &RTCPeerConnection) -> Result<String, anyhow::Error> {
        let description = pc
            .local_description()
            .await
            .ok_or_else(|| anyhow::anyhow!("local description missing after negotiation"))?;
        Ok(serde_json::to_string(&description)?)
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    fn current_session(&self) -> PeerSessionId {
        self.session.load(Ordering::SeqCst)
    }

    async fn create_offer(&self) -> Result<String, anyhow::Error> {
        let pc = self.connection().await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;
        Self::local_description_json(&pc).await
    }

    async fn create_answer(&self, remote_sdp: &str) -> Result<String, anyhow::Error> {
        let offer: RTCSessionDescription = serde_json::from_str(remote_sdp)?;
        let pc = self.connection().await?;
        pc.set_remote_description(offer).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;
        Self::local_description_json(&pc).await
    }

    async fn apply_answer(&self, remote_sdp: &str) -> Result<(), anyhow::Error> {
        let answer: RTCSessionDescription = serde_json::from_str(remote_sdp)?;
        let pc = self.existing_connection().await?;
        pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_remote_ice_candidate(&self, candidate: &str) -> Result<(), anyhow::Error> {
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)?;
        let pc = self.existing_connection().await?;
        pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) {
        let pc = {
            let mut slot = self.connection.lock().await;
            self.session.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        if let Some(pc) = pc {
            if let Err(e) = pc.close().await {
                warn!(target: "Peer", "Error closing peer connection: {e}");
            }
            info!(target: "Peer", "Peer connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (caller, _caller_events) = WebRtcPeer::with_ice_servers(Vec::new());
        let (callee, _callee_events) = WebRtcPeer::with_ice_servers(Vec::new());

        let offer = caller.create_offer().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&offer).unwrap();
        assert_eq!(value["type"], "offer");
        assert!(value["sdp"].as_str().unwrap().contains("m=audio"));
        assert!(value["sdp"].as_str().unwrap().contains("m=video"));

        let answer = callee.create_answer(&offer).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&answer).unwrap();
        assert_eq!(value["type"], "answer");

        caller.apply_answer(&answer).await.unwrap();

        caller.close().await;
        callee.close().await;
    }

    #[tokio::test]
    async fn test_close_moves_to_next_session() {
        let (peer, mut events) = WebRtcPeer::with_ice_servers(Vec::new());
        assert_eq!(peer.current_session(), 0);

        peer.create_offer().await.unwrap();
        peer.close().await;
        assert_eq!(peer.current_session(), 1);

        // Whatever the first connection emitted is tagged with its session.
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.session(), 0);
        }

        peer.create_offer().await.unwrap();
        assert_eq!(peer.current_session(), 1);
        peer.close().await;
        assert_eq!(peer.current_session(), 2);
    }

    #[tokio::test]
    async fn test_rejects_garbage_and_missing_connection() {
        let (peer, _events) = WebRtcPeer::with_ice_servers(Vec::new());
        assert!(peer.create_answer("not json").await.is_err());
        assert!(
            peer.apply_answer(r#"{"type":"answer","sdp":""}"#)
                .await
                .is_err()
        );
        assert!(
            peer.add_remote_ice_candidate(r#"{"candidate":""}"#)
                .await
                .is_err()
        );
        // Closing with nothing open is a no-op.
        peer.close().await;
    }
}
