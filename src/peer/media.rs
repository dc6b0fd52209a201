use crate::config::MediaConstraints;
use crate::error::CallError;
use crate::utils::random_id;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Исходящий аудиотрек. Сессии только прикрепляют его, остановка — при завершении звонка
pub struct LocalAudioTrack {
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl LocalAudioTrack {
    pub fn opus(id: String, stream_id: String) -> Self {
        let track = TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            id,
            stream_id,
        );
        Self {
            track: Arc::new(track),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        self.track.id()
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// true только при первом вызове
    pub fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Пишет закодированный Opus-кадр. Пока трек выключен, кадры отбрасываются (Ok(false)).
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<bool, CallError> {
        if self.is_stopped() {
            return Err(CallError::Media(format!("track {} is stopped", self.id())));
        }
        if !self.is_enabled() {
            return Ok(false);
        }
        self.track
            .write_sample(&Sample {
                data,
                duration,
                ..Default::default()
            })
            .await?;
        Ok(true)
    }
}

impl fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id())
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Набор локальных треков, общий для всех сессий
#[derive(Debug, Clone, Default)]
pub struct LocalTracks {
    tracks: Vec<Arc<LocalAudioTrack>>,
}

impl LocalTracks {
    pub fn new(tracks: Vec<Arc<LocalAudioTrack>>) -> Self {
        Self { tracks }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<LocalAudioTrack>> {
        self.tracks.iter()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn set_enabled(&self, enabled: bool) {
        for t in &self.tracks {
            t.set_enabled(enabled);
        }
    }

    /// Returns how many tracks were actually stopped by this call.
    pub fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Источник локального звука (устройство вне нашей зоны)
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalTracks, CallError>;
}

/// Источник по умолчанию: один Opus-трек, кадры в него пишет приложение
#[derive(Debug, Default, Clone)]
pub struct OpusMicrophone;

#[async_trait]
impl MediaSource for OpusMicrophone {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalTracks, CallError> {
        log::debug!(
            "Acquiring microphone: echo_cancellation={} noise_suppression={} auto_gain_control={}",
            constraints.echo_cancellation,
            constraints.noise_suppression,
            constraints.auto_gain_control
        );
        let track = LocalAudioTrack::opus(
            format!("audio-{}", random_id()),
            format!("roomcall-{}", random_id()),
        );
        Ok(LocalTracks::new(vec![Arc::new(track)]))
    }
}

/// Ленивая обёртка над источником: захват при первой необходимости, освобождение один раз
pub struct LocalMedia {
    source: Arc<dyn MediaSource>,
    constraints: MediaConstraints,
    tracks: Option<LocalTracks>,
    muted: bool,
}

impl LocalMedia {
    pub fn new(source: Arc<dyn MediaSource>, constraints: MediaConstraints) -> Self {
        Self {
            source,
            constraints,
            tracks: None,
            muted: false,
        }
    }

    pub fn is_required(&self) -> bool {
        self.constraints.required
    }

    pub async fn ensure(&mut self) -> Result<LocalTracks, CallError> {
        if let Some(tracks) = &self.tracks {
            return Ok(tracks.clone());
        }
        let tracks = self.source.acquire(&self.constraints).await?;
        if tracks.is_empty() {
            return Err(CallError::Media("media source returned no tracks".into()));
        }
        tracks.set_enabled(!self.muted);
        log::info!("Local media acquired: {} track(s)", tracks.len());
        self.tracks = Some(tracks.clone());
        Ok(tracks)
    }

    pub fn tracks(&self) -> Option<&LocalTracks> {
        self.tracks.as_ref()
    }

    pub fn set_muted(&mut self, muted: bool) -> bool {
        self.muted = muted;
        if let Some(tracks) = &self.tracks {
            tracks.set_enabled(!muted);
        }
        self.muted
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    /// Останавливает треки; после этого следующий `ensure` захватит заново
    pub fn release(&mut self) -> usize {
        match self.tracks.take() {
            Some(tracks) => {
                let stopped = tracks.stop_all();
                log::info!("Local media released, {} track(s) stopped", stopped);
                stopped
            }
            None => 0,
        }
    }
}
