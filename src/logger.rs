use crate::peer::state::SessionState;
use crate::peer::types::{IceCandidate, PeerId};
use serde::Serialize;
use std::io::Write;
use tokio::sync::mpsc;

/// Логирование с временными метками. `RUST_LOG` переопределяет уровень по умолчанию.
pub fn init() {
    let default_level = if crate::config::LOGGING_ENABLED {
        "roomcall=debug,webrtc=warn"
    } else {
        "off"
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format(|buf, record| {
            writeln!(
                buf,
                "RUST: [{}] {:<5} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, peer_id: &PeerId, cand: &IceCandidate) {
    log::debug!(
        "Trickle {label} [{peer_id}]: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}

pub fn dump_transition(peer_id: &PeerId, session_id: u64, from: SessionState, to: SessionState) {
    log::debug!("Session {peer_id}#{session_id}: {from:?} -> {to:?}");
}

/// События для прикладного слоя (UI)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    PeerConnecting { peer_id: PeerId },
    PeerConnected { peer_id: PeerId },
    ConnectionProblem { peer_id: PeerId },
    ConnectionRecovered { peer_id: PeerId },
    PeerTimedOut { peer_id: PeerId },
    PeerLost { peer_id: PeerId, attempts: u32 },
    PeerRemoved { peer_id: PeerId },
    RemoteTrack { peer_id: PeerId, track_id: String },
    MuteChanged { muted: bool },
    CallFailed { reason: String },
}

/// Отправитель событий; без подписчика события только логируются
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<CallEvent>>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<CallEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    fn emit(&self, event: CallEvent) {
        log::debug!("emit {:?}", event);
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                log::debug!("Event receiver dropped, event discarded");
            }
        }
    }

    pub fn emit_connecting(&self, peer_id: &PeerId) {
        self.emit(CallEvent::PeerConnecting {
            peer_id: peer_id.clone(),
        });
    }

    pub fn emit_connected(&self, peer_id: &PeerId) {
        log::info!("Peer {peer_id} connected");
        self.emit(CallEvent::PeerConnected {
            peer_id: peer_id.clone(),
        });
    }

    pub fn emit_connection_problem(&self, peer_id: &PeerId) {
        log::warn!("Connection problem with {peer_id}, waiting for ICE to recover");
        self.emit(CallEvent::ConnectionProblem {
            peer_id: peer_id.clone(),
        });
    }

    pub fn emit_connection_recovered(&self, peer_id: &PeerId) {
        log::info!("Connection with {peer_id} recovered");
        self.emit(CallEvent::ConnectionRecovered {
            peer_id: peer_id.clone(),
        });
    }

    pub fn emit_timed_out(&self, peer_id: &PeerId) {
        self.emit(CallEvent::PeerTimedOut {
            peer_id: peer_id.clone(),
        });
    }

    pub fn emit_lost(&self, peer_id: &PeerId, attempts: u32) {
        log::warn!("Connection to {peer_id} lost after {attempts} recovery attempt(s)");
        self.emit(CallEvent::PeerLost {
            peer_id: peer_id.clone(),
            attempts,
        });
    }

    pub fn emit_removed(&self, peer_id: &PeerId) {
        self.emit(CallEvent::PeerRemoved {
            peer_id: peer_id.clone(),
        });
    }

    pub fn emit_remote_track(&self, peer_id: &PeerId, track_id: String) {
        self.emit(CallEvent::RemoteTrack {
            peer_id: peer_id.clone(),
            track_id,
        });
    }

    pub fn emit_mute_changed(&self, muted: bool) {
        self.emit(CallEvent::MuteChanged { muted });
    }

    pub fn emit_call_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        log::error!("Call failed: {reason}");
        self.emit(CallEvent::CallFailed { reason });
    }
}
