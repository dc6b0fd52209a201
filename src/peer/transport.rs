use crate::error::CallError;
use crate::peer::media::LocalTracks;
use crate::peer::state::TransportState;
use crate::peer::types::{IceCandidate, PeerId, Role, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Событие от транспорта конкретной сессии
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    RemoteTrack { track_id: String },
}

/// Внутреннее событие движка
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Transport {
        peer_id: PeerId,
        session_id: u64,
        event: TransportEvent,
    },
    EstablishTimeout {
        peer_id: PeerId,
        session_id: u64,
    },
}

pub type EngineEventTx = mpsc::UnboundedSender<EngineEvent>;

/// Подписка транспорта на движок; после `dispose` колбэки молчат
#[derive(Debug, Clone)]
pub struct TransportSubscription {
    peer_id: PeerId,
    session_id: u64,
    active: Arc<AtomicBool>,
    tx: EngineEventTx,
}

impl TransportSubscription {
    pub fn new(peer_id: PeerId, session_id: u64, tx: EngineEventTx) -> Self {
        Self {
            peer_id,
            session_id,
            active: Arc::new(AtomicBool::new(true)),
            tx,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Returns false once disposed or when the engine is gone.
    pub fn post(&self, event: TransportEvent) -> bool {
        if !self.is_active() {
            return false;
        }
        self.tx
            .send(EngineEvent::Transport {
                peer_id: self.peer_id.clone(),
                session_id: self.session_id,
                event,
            })
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn dispose(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Всё, что нужно фабрике для создания транспорта
#[derive(Debug, Clone)]
pub struct TransportContext {
    pub peer_id: PeerId,
    pub session_id: u64,
    pub role: Role,
    pub local_tracks: Option<LocalTracks>,
    pub subscription: TransportSubscription,
}

/// Низкоуровневое соединение с одним участником
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Создаёт offer и ставит его локальным описанием
    async fn create_offer(&self) -> Result<SessionDescription, CallError>;

    /// Создаёт answer и ставит его локальным описанием
    async fn create_answer(&self) -> Result<SessionDescription, CallError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CallError>;

    /// Закрывает соединение и отцепляет локальные треки
    async fn close(&self) -> Result<(), CallError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, ctx: TransportContext) -> Result<Box<dyn PeerTransport>, CallError>;
}
