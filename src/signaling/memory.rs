use super::{HandlerRegistry, HubEvent, SignalingChannel, Subscription};
use crate::error::SignalingError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Сигнальный канал в памяти: хост сам доставляет входящие вызовы и забирает исходящие
#[derive(Default)]
pub struct MemorySignaling {
    registry: HandlerRegistry,
    sent: Mutex<Vec<HubEvent>>,
    closed: AtomicBool,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Доставляет входящий вызов подписчикам, возвращает их число
    pub fn deliver(&self, target: &str, args: Vec<Value>) -> usize {
        self.registry.dispatch(target, args)
    }

    pub fn sent(&self) -> Vec<HubEvent> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn take_sent(&self) -> Vec<HubEvent> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn handler_count(&self) -> usize {
        self.registry.handler_count()
    }
}

impl SignalingChannel for MemorySignaling {
    fn send(&self, target: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SignalingError::Closed);
        }
        log::debug!("memory -> {target} ({} arg(s))", args.len());
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(HubEvent {
                target: target.to_string(),
                args,
            });
        Ok(())
    }

    fn subscribe(&self, targets: &[&str]) -> Subscription {
        self.registry.subscribe(targets)
    }
}
