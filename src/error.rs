use crate::peer::state::SessionState;
use crate::peer::types::PeerId;
use thiserror::Error;

/// Ошибки движка звонка
#[derive(Debug, Error)]
pub enum CallError {
    #[error("local media unavailable: {0}")]
    Media(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    WebRtc(#[from] webrtc::Error),

    #[error("no session for peer {0}")]
    NoSession(PeerId),

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("call engine stopped")]
    EngineStopped,
}

/// Ошибки сигнального канала
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    Closed,

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid endpoint url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Ошибки конфигурации
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
