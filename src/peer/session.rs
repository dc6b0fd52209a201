use crate::error::CallError;
use crate::health::EstablishTimer;
use crate::logger::dump_transition;
use crate::peer::media::LocalTracks;
use crate::peer::state::{SessionState, TransportState};
use crate::peer::transport::{PeerTransport, TransportSubscription};
use crate::peer::types::{IceCandidate, PeerId, Role};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Сессия с одним удалённым участником. Владеет транспортом единолично.
pub struct PeerSession {
    pub(crate) peer_id: PeerId,
    pub(crate) id: u64,
    pub(crate) role: Role,
    pub(crate) state: SessionState,
    pub(crate) transport: Box<dyn PeerTransport>,
    pub(crate) local_tracks: Option<LocalTracks>,
    pub(crate) subscription: TransportSubscription,
    pub(crate) establish_timer: EstablishTimer,
    pub(crate) transport_state: TransportState,
    pub(crate) local_candidates: Vec<IceCandidate>,
    // ufrag текущего remote description
    pub(crate) remote_ufrag: Option<String>,
    pub(crate) renegotiations: u32,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) connected_at: Option<DateTime<Utc>>,
}

impl PeerSession {
    pub(crate) fn new(
        peer_id: PeerId,
        id: u64,
        role: Role,
        transport: Box<dyn PeerTransport>,
        local_tracks: Option<LocalTracks>,
        subscription: TransportSubscription,
        establish_timer: EstablishTimer,
    ) -> Self {
        Self {
            peer_id,
            id,
            role,
            state: SessionState::Created,
            transport,
            local_tracks,
            subscription,
            establish_timer,
            transport_state: TransportState::New,
            local_candidates: Vec::new(),
            remote_ufrag: None,
            renegotiations: 0,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.state.has_remote_description()
    }

    pub(crate) fn transition(&mut self, next: SessionState) -> Result<(), CallError> {
        if !self.state.can_transition(next) {
            return Err(CallError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        dump_transition(&self.peer_id, self.id, self.state, next);
        self.state = next;
        if next == SessionState::Connected && self.connected_at.is_none() {
            self.connected_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Освобождает таймер, подписку и транспорт. Вызывается ровно один раз: метод забирает self.
    pub(crate) async fn close(mut self) {
        self.establish_timer.cancel();
        self.subscription.dispose();
        if let Err(e) = self.transport.close().await {
            log::warn!("Error closing transport for {}: {e}", self.peer_id);
        }
        if let Some(tracks) = self.local_tracks.take() {
            log::debug!(
                "Detached {} local track(s) from {}#{}",
                tracks.len(),
                self.peer_id,
                self.id
            );
        }
        if self.state != SessionState::Closed {
            dump_transition(&self.peer_id, self.id, self.state, SessionState::Closed);
            self.state = SessionState::Closed;
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            session_id: self.id,
            role: self.role,
            state: self.state,
            transport_state: self.transport_state,
            renegotiations: self.renegotiations,
            awaiting_connection: self.establish_timer.is_armed(),
            created_at: self.created_at,
            connected_at: self.connected_at,
        }
    }
}

/// Копия состояния сессии для UI; ссылок на саму сессию наружу не выдаём
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerSnapshot {
    pub peer_id: PeerId,
    pub session_id: u64,
    pub role: Role,
    pub state: SessionState,
    pub transport_state: TransportState,
    pub renegotiations: u32,
    /// таймер установления ещё взведён
    pub awaiting_connection: bool,
    pub created_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
}
