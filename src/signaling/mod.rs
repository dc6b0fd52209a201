pub mod events;
pub mod hub;
pub mod memory;
pub mod protocol;

use crate::error::SignalingError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

pub use events::{InboundSignal, INBOUND_TARGETS};
pub use hub::{HubConnection, HubState};
pub use memory::MemorySignaling;

/// Вызов метода хаба в любую сторону
#[derive(Debug, Clone, PartialEq)]
pub struct HubEvent {
    pub target: String,
    pub args: Vec<Value>,
}

pub trait SignalingChannel: Send + Sync {
    fn send(&self, target: &str, args: Vec<Value>) -> Result<(), SignalingError>;

    fn subscribe(&self, targets: &[&str]) -> Subscription;

    // замена off(eventName): отписка через drop подписки
    fn on(&self, target: &str) -> Subscription {
        self.subscribe(&[target])
    }
}

struct Handler {
    targets: Vec<String>,
    tx: mpsc::UnboundedSender<HubEvent>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u64, Handler>>,
}

impl RegistryInner {
    fn remove(&self, id: u64) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }
}

/// Реестр обработчиков входящих вызовов
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, targets: &[&str]) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                Handler {
                    targets: targets.iter().map(|t| t.to_string()).collect(),
                    tx,
                },
            );
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner),
            rx,
        }
    }

    /// Раздаёт вызов всем подписчикам на этот метод (имена без учёта регистра).
    /// Возвращает число получателей.
    pub fn dispatch(&self, target: &str, args: Vec<Value>) -> usize {
        let mut handlers = self
            .inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        handlers.retain(|_, handler| {
            if !handler.targets.iter().any(|t| t.eq_ignore_ascii_case(target)) {
                return true;
            }
            let event = HubEvent {
                target: target.to_string(),
                args: args.clone(),
            };
            match handler.tx.send(event) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });
        if delivered == 0 {
            log::debug!("No handler registered for '{target}'");
        }
        delivered
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Один зарегистрированный обработчик; drop снимает только его
pub struct Subscription {
    id: u64,
    registry: Weak<RegistryInner>,
    rx: mpsc::UnboundedReceiver<HubEvent>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<HubEvent> {
        self.rx.try_recv().ok()
    }

    pub fn dispose(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
