//! WebRTC connection backend on the `webrtc` crate
//!
//! Local tracks are published as sample tracks. Whatever captures the
//! camera, microphone or screen writes encoded frames into the tracks
//! returned by [`RtcConnector::sample_tracks`], skipping frames while the
//! [`MediaTrack`] is disabled. Remote tracks surface as [`MediaTrack`]
//! handles in [`LinkEventKind::RemoteStream`].

use crate::error::{MeshError, Result};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::peer::PeerId;
use crate::signaling::{
    ConnectionEvents, IceCandidate, IceServer, LinkEventKind, PeerConnection, PeerConnector,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        }
    }
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48_000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90_000,
            ..Default::default()
        },
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Creates [`RtcConnection`]s from one shared media engine
pub struct RtcConnector {
    api: API,
    connections: Mutex<HashMap<PeerId, Arc<RtcConnection>>>,
}

impl RtcConnector {
    /// Connector with the default codecs (Opus, VP8, VP9, H.264) and
    /// interceptors
    pub fn new() -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| MeshError::Backend(e.to_string()))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| MeshError::Backend(e.to_string()))?;

        Ok(Self {
            api: APIBuilder::new()
                .with_media_engine(media)
                .with_interceptor_registry(registry)
                .build(),
            connections: Mutex::new(HashMap::new()),
        })
    }

    /// Open connection to `peer`, if any
    pub fn connection(&self, peer: &PeerId) -> Option<Arc<RtcConnection>> {
        self.connections
            .lock()
            .get(peer)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Every open link's sample track for `track`; a capture loop writes
    /// each frame to all of them
    pub fn sample_tracks(&self, track: &MediaTrack) -> Vec<Arc<TrackLocalStaticSample>> {
        let mut connections = self.connections.lock();
        connections.retain(|_, c| !c.is_closed());
        connections
            .values()
            .filter_map(|c| c.local_track(track.id()))
            .collect()
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        ice_servers: &[IceServer],
        events: ConnectionEvents,
    ) -> Result<Arc<dyn PeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(rtc_ice_server).collect(),
            ..Default::default()
        };
        let pc = self
            .api
            .new_peer_connection(config)
            .await
            .map_err(|e| MeshError::negotiation(peer, e.to_string()))?;

        let connection = Arc::new(RtcConnection {
            peer: peer.clone(),
            pc: Arc::new(pc),
            reporter: Reporter {
                events,
                closed: Arc::new(AtomicBool::new(false)),
            },
            local_tracks: Mutex::new(HashMap::new()),
            video_sender: Mutex::new(None),
            remote_tracks: Arc::new(Mutex::new(Vec::new())),
        });
        connection.install_handlers();

        if let Some(stale) = self.connections.lock().insert(peer.clone(), connection.clone()) {
            stale.close();
        }
        Ok(connection)
    }
}

/// Forwards connection callbacks until the connection is closed locally,
/// so a replaced link never reports into its successor
#[derive(Clone)]
struct Reporter {
    events: ConnectionEvents,
    closed: Arc<AtomicBool>,
}

impl Reporter {
    fn emit(&self, kind: LinkEventKind) {
        if !self.closed.load(Ordering::SeqCst) {
            self.events.emit(kind);
        }
    }
}

/// One `RTCPeerConnection` to a remote participant
pub struct RtcConnection {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    reporter: Reporter,
    local_tracks: Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
    remote_tracks: Arc<Mutex<Vec<MediaTrack>>>,
}

impl RtcConnection {
    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.reporter.closed.load(Ordering::SeqCst)
    }

    /// Sample track published for the local track `track_id`
    pub fn local_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().get(track_id).cloned()
    }

    fn install_handlers(&self) {
        let reporter = self.reporter.clone();
        self.pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let reporter = reporter.clone();
            Box::pin(async move {
                // `None` marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => reporter.emit(LinkEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!(error = %e, "Unserializable local candidate"),
                }
            })
        }));

        let reporter = self.reporter.clone();
        let peer = self.peer.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                debug!(peer = %peer, state = ?state, "Peer connection state");
                match state {
                    RTCPeerConnectionState::Connected => reporter.emit(LinkEventKind::Connected),
                    RTCPeerConnectionState::Failed => {
                        reporter.emit(LinkEventKind::Failed("ICE connection failed".into()))
                    }
                    RTCPeerConnectionState::Closed => reporter.emit(LinkEventKind::Closed),
                    _ => {}
                }
                Box::pin(async {})
            }));

        let reporter = self.reporter.clone();
        let remote = self.remote_tracks.clone();
        self.pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            let handle = MediaTrack::new(TrackKind::from(track.kind()), track.id());
            let stream = {
                let mut tracks = remote.lock();
                tracks.push(handle);
                MediaStream::new(tracks.clone())
            };
            reporter.emit(LinkEventKind::RemoteStream(stream));
            Box::pin(async {})
        }));
    }

    /// Add the local tracks once; later offers reuse the same senders
    async fn publish(&self, local: Option<&MediaStream>) -> Result<()> {
        let Some(stream) = local else {
            return Ok(());
        };
        if !self.local_tracks.lock().is_empty() {
            return Ok(());
        }

        for track in stream.tracks() {
            let sample = Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind()),
                track.id().to_string(),
                stream.id().to_string(),
            ));
            let sender = self
                .pc
                .add_track(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| self.failed(e))?;
            drain_rtcp(sender.clone());

            if track.kind() == TrackKind::Video {
                *self.video_sender.lock() = Some(sender);
            }
            self.local_tracks.lock().insert(track.id().to_string(), sample);
        }
        Ok(())
    }

    fn failed(&self, error: webrtc::Error) -> MeshError {
        MeshError::negotiation(&self.peer, error.to_string())
    }
}

/// Senders must be read for interceptors (NACK, reports) to run
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

#[async_trait]
impl PeerConnection for RtcConnection {
    async fn create_offer(&self, local: Option<&MediaStream>) -> Result<String> {
        self.publish(local).await?;
        let offer = self.pc.create_offer(None).await.map_err(|e| self.failed(e))?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(|e| self.failed(e))?;
        Ok(sdp)
    }

    async fn accept_offer(&self, sdp: &str, local: Option<&MediaStream>) -> Result<String> {
        self.publish(local).await?;
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(|e| self.failed(e))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| self.failed(e))?;

        let answer = self.pc.create_answer(None).await.map_err(|e| self.failed(e))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| self.failed(e))?;
        Ok(sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(|e| self.failed(e))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| self.failed(e))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate.clone(),
                sdp_mid: candidate.sdp_mid.clone(),
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| self.failed(e))
    }

    async fn replace_video_track(&self, track: Option<&MediaTrack>) -> Result<()> {
        let sender = self
            .video_sender
            .lock()
            .clone()
            .ok_or_else(|| MeshError::negotiation(&self.peer, "no video sender"))?;

        let replacement = match track {
            Some(track) => {
                let sample = {
                    let mut tracks = self.local_tracks.lock();
                    tracks
                        .entry(track.id().to_string())
                        .or_insert_with(|| {
                            Arc::new(TrackLocalStaticSample::new(
                                codec_for(TrackKind::Video),
                                track.id().to_string(),
                                format!("huddle-{}", self.peer),
                            ))
                        })
                        .clone()
                };
                Some(sample as Arc<dyn TrackLocal + Send + Sync>)
            }
            None => None,
        };

        sender
            .replace_track(replacement)
            .await
            .map_err(|e| self.failed(e))
    }

    fn close(&self) {
        if self.reporter.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let pc = self.pc.clone();
        let peer = self.peer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = pc.close().await {
                    debug!(peer = %peer, error = %e, "Peer connection close failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn local_media() -> MediaStream {
        MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ])
    }

    async fn connect(connector: &RtcConnector, peer: &str) -> Arc<dyn PeerConnection> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::new(peer);
        connector
            .connect(&peer, &[], ConnectionEvents::new(peer.clone(), tx))
            .await
            .unwrap()
    }

    #[test]
    fn test_ice_server_mapping() {
        let turn = IceServer {
            urls: vec!["turn:turn.example:3478".into()],
            username: Some("u".into()),
            credential: Some("p".into()),
        };
        let rtc = rtc_ice_server(&turn);
        assert_eq!(rtc.urls, turn.urls);
        assert_eq!(rtc.username, "u");
        assert_eq!(rtc_ice_server(&IceServer::stun("stun:s")).credential, "");
    }

    #[tokio::test]
    async fn test_offer_answer_round() {
        let caller_side = RtcConnector::new().unwrap();
        let callee_side = RtcConnector::new().unwrap();
        let to_callee = connect(&caller_side, "callee").await;
        let to_caller = connect(&callee_side, "caller").await;

        let offer = to_callee.create_offer(Some(&local_media())).await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));

        let answer = to_caller.accept_offer(&offer, None).await.unwrap();
        assert!(answer.starts_with("v=0"));
        to_callee.accept_answer(&answer).await.unwrap();

        to_callee.close();
        to_caller.close();
    }

    #[tokio::test]
    async fn test_screen_replaces_camera_sender() {
        let connector = RtcConnector::new().unwrap();
        let conn = connect(&connector, "p").await;
        let local = local_media();
        conn.create_offer(Some(&local)).await.unwrap();

        let screen = MediaTrack::new(TrackKind::Video, "screen");
        conn.replace_video_track(Some(&screen)).await.unwrap();
        assert_eq!(connector.sample_tracks(&screen).len(), 1);
        assert_eq!(connector.sample_tracks(local.audio_track().unwrap()).len(), 1);

        conn.close();
        assert!(connector.sample_tracks(&screen).is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_offer_fails() {
        let connector = RtcConnector::new().unwrap();
        let conn = connect(&connector, "p").await;
        assert!(matches!(
            conn.accept_offer("not sdp", None).await,
            Err(MeshError::NegotiationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_audio_only_cannot_replace_video() {
        let connector = RtcConnector::new().unwrap();
        let conn = connect(&connector, "p").await;
        let audio = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "mic")]);
        conn.create_offer(Some(&audio)).await.unwrap();

        let screen = MediaTrack::new(TrackKind::Video, "screen");
        assert!(conn.replace_video_track(Some(&screen)).await.is_err());
    }
}
