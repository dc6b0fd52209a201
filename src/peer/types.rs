use serde::{Deserialize, Serialize};
use std::fmt;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// Идентификатор участника комнаты: сервер отдаёт числа, но допускаем и строки
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum PeerId {
    Numeric(u64),
    Opaque(String),
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Numeric(id) => write!(f, "{id}"),
            PeerId::Opaque(id) => f.write_str(id),
        }
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        PeerId::Numeric(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId::Opaque(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        PeerId::Opaque(id)
    }
}

/// Участник комнаты (поля сверх `id` сервер может не присылать)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Occupant {
    pub id: PeerId,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

impl Occupant {
    pub fn new(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            login: None,
            connection_id: None,
        }
    }
}

/// Снимок комнаты
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: PeerId,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub users: Vec<Occupant>,
}

/// Роль стороны в переговорах
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP в браузерном формате `{ "type": "offer", "sdp": "..." }`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    /// Значение `a=ice-ufrag` (первое в SDP)
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix("a=ice-ufrag:"))
            .map(str::trim)
            .filter(|ufrag| !ufrag.is_empty())
    }

    pub fn to_rtc(&self) -> Result<RTCSessionDescription, webrtc::Error> {
        match self.kind {
            SdpKind::Offer => RTCSessionDescription::offer(self.sdp.clone()),
            SdpKind::Answer => RTCSessionDescription::answer(self.sdp.clone()),
        }
    }
}

/// ICE кандидат в браузерном формате
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            ..Default::default()
        }
    }

    /// Тип кандидата из строки `typ host|srflx|relay`
    pub fn kind(&self) -> Option<&str> {
        let mut parts = self.candidate.split_whitespace();
        while let Some(part) = parts.next() {
            if part == "typ" {
                return parts.next();
            }
        }
        None
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        IceCandidate {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

/// Полезная нагрузка переговоров: закрытый набор вариантов
#[derive(Debug, Clone, PartialEq)]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    /// Имя метода хаба для отправки
    pub fn target(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "SendOffer",
            SignalPayload::Answer(_) => "SendAnswer",
            SignalPayload::Candidate(_) => "SendCandidate",
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            SignalPayload::Offer(d) | SignalPayload::Answer(d) => serde_json::to_value(d),
            SignalPayload::Candidate(c) => serde_json::to_value(c),
        }
    }
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}
