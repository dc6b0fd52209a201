use crate::peer::transport::{EngineEvent, EngineEventTx};
use crate::peer::types::PeerId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::sleep;

/// Таймер установления соединения. Отменяется один раз; при drop тоже отменяется.
#[derive(Debug, Default)]
pub struct EstablishTimer {
    handle: Option<AbortHandle>,
}

impl EstablishTimer {
    pub fn schedule(peer_id: PeerId, session_id: u64, after: Duration, tx: EngineEventTx) -> Self {
        let handle = tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(EngineEvent::EstablishTimeout {
                peer_id,
                session_id,
            });
        })
        .abort_handle();
        Self {
            handle: Some(handle),
        }
    }

    /// true только если таймер был взведён
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for EstablishTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Решение после отказа установленного соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Replace { attempt: u32 },
    GiveUp { attempts: u32 },
}

/// Таймаут установления и лимит подряд идущих восстановлений по каждому участнику
#[derive(Debug)]
pub struct HealthMonitor {
    establish_timeout: Duration,
    max_recoveries: Option<u32>,
    recoveries: HashMap<PeerId, u32>,
}

impl HealthMonitor {
    pub fn new(establish_timeout: Duration, max_recoveries: Option<u32>) -> Self {
        Self {
            establish_timeout,
            max_recoveries,
            recoveries: HashMap::new(),
        }
    }

    pub fn establish_timeout(&self) -> Duration {
        self.establish_timeout
    }

    pub fn arm(&self, peer_id: &PeerId, session_id: u64, tx: &EngineEventTx) -> EstablishTimer {
        EstablishTimer::schedule(peer_id.clone(), session_id, self.establish_timeout, tx.clone())
    }

    /// Соединение установлено: счётчик подряд идущих восстановлений сбрасывается
    pub fn on_connected(&mut self, peer_id: &PeerId) {
        if let Some(n) = self.recoveries.remove(peer_id) {
            log::debug!("Peer {peer_id} healthy again after {n} recovery attempt(s)");
        }
    }

    pub fn on_failure(&mut self, peer_id: &PeerId) -> Recovery {
        let attempts = self.recoveries.get(peer_id).copied().unwrap_or(0);
        match self.max_recoveries {
            Some(max) if attempts >= max => {
                self.recoveries.remove(peer_id);
                Recovery::GiveUp { attempts }
            }
            _ => {
                let attempt = attempts + 1;
                self.recoveries.insert(peer_id.clone(), attempt);
                Recovery::Replace { attempt }
            }
        }
    }

    pub fn attempts(&self, peer_id: &PeerId) -> u32 {
        self.recoveries.get(peer_id).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, peer_id: &PeerId) {
        self.recoveries.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.recoveries.clear();
    }
}
