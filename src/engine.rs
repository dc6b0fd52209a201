use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::Notifier;
use crate::manager::ConnectionManager;
use crate::peer::media::{LocalTracks, MediaSource};
use crate::peer::session::PeerSnapshot;
use crate::peer::transport::TransportFactory;
use crate::peer::types::PeerId;
use crate::signaling::{SignalingChannel, Subscription, INBOUND_TARGETS};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Состояние звонка целиком, для UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub local_id: Option<PeerId>,
    pub muted: bool,
    pub peers: Vec<PeerSnapshot>,
}

enum Command {
    SetMuted {
        muted: bool,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<CallSnapshot>,
    },
    LocalTracks {
        reply: oneshot::Sender<Option<LocalTracks>>,
    },
    HangUp {
        reply: oneshot::Sender<()>,
    },
}

/// Ручка для приложения; все вызовы проходят через цикл движка
#[derive(Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Возвращает применённое состояние
    pub async fn set_muted(&self, muted: bool) -> Result<bool, CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Треки для записи исходящего звука; `None`, пока микрофон не захвачен
    pub async fn local_tracks(&self) -> Result<Option<LocalTracks>, CallError> {
        self.request(|reply| Command::LocalTracks { reply }).await
    }

    /// Закрывает все сессии, освобождает микрофон и останавливает движок
    pub async fn hang_up(&self) -> Result<(), CallError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Один таск владеет менеджером: входящая сигнализация, колбэки, таймеры и команды по очереди
pub struct CallEngine {
    manager: ConnectionManager,
    inbound: Subscription,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl CallEngine {
    /// Подписка на хаб оформляется сразу, чтобы не потерять события до запуска цикла
    pub fn new(
        config: CallConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        media_source: Arc<dyn MediaSource>,
        notifier: Notifier,
    ) -> (Self, CallHandle) {
        let inbound = signaling.subscribe(&INBOUND_TARGETS);
        let manager = ConnectionManager::new(config, factory, signaling, media_source, notifier);
        let (tx, commands) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                inbound,
                commands,
            },
            CallHandle { tx },
        )
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) {
        log::info!("Call engine started");
        loop {
            tokio::select! {
                biased;

                event = self.inbound.recv() => match event {
                    Some(event) => self.manager.handle_hub_event(&event).await,
                    None => {
                        log::warn!("Signaling channel went away");
                        break;
                    }
                },
                Some(event) = self.manager.next_engine_event() => {
                    self.manager.handle_engine_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            return;
                        }
                    }
                    None => {
                        log::info!("All call handles dropped");
                        break;
                    }
                },
            }
        }
        self.manager.teardown_all().await;
    }

    /// false — звонок завершён, цикл останавливается
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::SetMuted { muted, reply } => {
                let _ = reply.send(self.manager.set_outbound_muted(muted));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(CallSnapshot {
                    local_id: self.manager.local_id().cloned(),
                    muted: self.manager.is_muted(),
                    peers: self.manager.snapshot(),
                });
            }
            Command::LocalTracks { reply } => {
                let _ = reply.send(self.manager.local_tracks());
            }
            Command::HangUp { reply } => {
                self.manager.teardown_all().await;
                let _ = reply.send(());
                log::info!("Call ended");
                return false;
            }
        }
        true
    }
}
