use crate::error::CallError;
use crate::logger::dump_candidate;
use crate::peer::media::LocalTracks;
use crate::peer::state::TransportState;
use crate::peer::transport::{
    PeerTransport, TransportContext, TransportEvent, TransportFactory, TransportSubscription,
};
use crate::peer::types::{IceCandidate, PeerId, Role, ServerConfig, SessionDescription};
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// RTP-кадр удалённого звука (Opus payload как есть)
#[derive(Debug, Clone)]
pub struct RemoteAudioFrame {
    pub peer_id: PeerId,
    pub track_id: String,
    pub payload: Bytes,
    pub timestamp: u32,
}

pub type RemoteAudioSink = mpsc::UnboundedSender<RemoteAudioFrame>;

/// Создаёт `RTCPeerConnection` на каждую сессию
pub struct WebRtcTransportFactory {
    api: API,
    ice_servers: Vec<ServerConfig>,
    audio_sink: Option<RemoteAudioSink>,
}

impl WebRtcTransportFactory {
    pub fn new(ice_servers: Vec<ServerConfig>) -> Result<Self, CallError> {
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
            ice_servers,
            audio_sink: None,
        })
    }

    /// Куда отдавать входящий звук; без приёмника RTP читается и выбрасывается
    pub fn with_audio_sink(mut self, sink: RemoteAudioSink) -> Self {
        self.audio_sink = Some(sink);
        self
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: get_user_ice_servers(servers),
        // Добавляем более агрессивные настройки ICE
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn transport_state(st: RTCPeerConnectionState) -> Option<TransportState> {
    match st {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, ctx: TransportContext) -> Result<Box<dyn PeerTransport>, CallError> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(&self.ice_servers)).await?);
        let readers: Arc<Mutex<Vec<AbortHandle>>> = Arc::new(Mutex::new(Vec::new()));

        let sub = ctx.subscription.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            let sub = sub.clone();
            Box::pin(async move {
                match cand {
                    Some(c) => match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::from(init);
                            dump_candidate("LOCAL", sub.peer_id(), &candidate);
                            sub.post(TransportEvent::LocalCandidate(candidate));
                        }
                        Err(e) => log::warn!("Failed to serialize local candidate: {e}"),
                    },
                    // cand == None означает конец сбора
                    None => log::debug!("ICE gathering completed for {}", sub.peer_id()),
                }
            })
        }));

        let peer_id = ctx.peer_id.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state| {
            log::debug!("ICE gathering state for {peer_id} changed to: {:?}", state);
            Box::pin(async {})
        }));

        let sub = ctx.subscription.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            log::debug!("Peer connection state for {} changed to: {:?}", sub.peer_id(), st);
            if let Some(state) = transport_state(st) {
                sub.post(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let sub = ctx.subscription.clone();
        let sink = self.audio_sink.clone();
        let track_readers = readers.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let track_id = track.id();
                log::info!(
                    "Remote {:?} track {} from {}",
                    track.kind(),
                    track_id,
                    sub.peer_id()
                );
                if sub.post(TransportEvent::RemoteTrack {
                    track_id: track_id.clone(),
                }) {
                    let handle = spawn_rtp_reader(track, sub.clone(), track_id, sink.clone());
                    track_readers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(handle);
                }
                Box::pin(async {})
            },
        ));

        let mut senders = Vec::new();
        match &ctx.local_tracks {
            Some(tracks) => {
                for track in tracks.iter() {
                    let sender = pc
                        .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                        .await?;
                    readers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(spawn_rtcp_drain(sender.clone()));
                    senders.push(sender);
                }
            }
            None if ctx.role == Role::Initiator => {
                // без своего звука всё равно просим аудио у собеседника
                pc.add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await?;
            }
            None => {}
        }

        log::debug!(
            "Created peer connection for {}#{} as {:?}",
            ctx.peer_id,
            ctx.session_id,
            ctx.role
        );
        Ok(Box::new(WebRtcTransport {
            pc,
            subscription: ctx.subscription,
            local_tracks: ctx.local_tracks,
            senders,
            readers,
            closed: AtomicBool::new(false),
        }))
    }
}

fn spawn_rtp_reader(
    track: Arc<TrackRemote>,
    sub: TransportSubscription,
    track_id: String,
    sink: Option<RemoteAudioSink>,
) -> AbortHandle {
    tokio::spawn(async move {
        loop {
            match track.read_rtp().await {
                Ok((packet, _)) => {
                    if packet.payload.is_empty() {
                        continue;
                    }
                    if let Some(sink) = &sink {
                        let frame = RemoteAudioFrame {
                            peer_id: sub.peer_id().clone(),
                            track_id: track_id.clone(),
                            payload: packet.payload,
                            timestamp: packet.header.timestamp,
                        };
                        if sink.send(frame).is_err() {
                            log::debug!("Remote audio sink dropped, discarding further frames");
                        }
                    }
                }
                Err(e) => {
                    log::debug!("Remote track {track_id} ended: {e}");
                    break;
                }
            }
        }
    })
    .abort_handle()
}

/// RTCP от получателя надо вычитывать, иначе интерсепторы не работают
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>) -> AbortHandle {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    })
    .abort_handle()
}

pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    subscription: TransportSubscription,
    local_tracks: Option<LocalTracks>,
    senders: Vec<Arc<RTCRtpSender>>,
    readers: Arc<Mutex<Vec<AbortHandle>>>,
    closed: AtomicBool,
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.pc.set_remote_description(desc.to_rtc()?).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.subscription.dispose();
        for handle in self
            .readers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            handle.abort();
        }
        // треки общие: только отцепляем, останавливает их владелец
        for sender in &self.senders {
            if let Err(e) = self.pc.remove_track(sender).await {
                log::debug!("remove_track for {}: {e}", self.subscription.peer_id());
            }
        }
        if let Some(tracks) = &self.local_tracks {
            log::debug!(
                "Detached {} local track(s) from {}",
                tracks.len(),
                self.subscription.peer_id()
            );
        }
        self.pc.close().await?;
        Ok(())
    }
}
