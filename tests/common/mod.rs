#![allow(dead_code)]

use async_trait::async_trait;
use roomcall::config::MediaConstraints;
use roomcall::manager::ConnectionManager;
use roomcall::peer::media::{LocalTracks, MediaSource, OpusMicrophone};
use roomcall::peer::transport::{
    PeerTransport, TransportContext, TransportEvent, TransportFactory, TransportSubscription,
};
use roomcall::signaling::HubEvent;
use roomcall::{
    CallConfig, CallError, CallEvent, IceCandidate, MemorySignaling, Notifier, Occupant, PeerId,
    Role, SessionDescription, TransportState,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// What one fake transport saw, in order.
#[derive(Debug, Clone, Default)]
pub struct TransportRecord {
    pub peer_id: Option<PeerId>,
    pub session_id: u64,
    pub role: Option<Role>,
    pub has_local_tracks: bool,
    pub offers_created: usize,
    pub answers_created: usize,
    pub remote_descriptions: Vec<SessionDescription>,
    pub applied_candidates: Vec<IceCandidate>,
    pub close_calls: usize,
}

#[derive(Clone)]
pub struct FakeHandle {
    record: Arc<Mutex<TransportRecord>>,
    subscription: TransportSubscription,
}

impl FakeHandle {
    pub fn record(&self) -> TransportRecord {
        self.record.lock().unwrap().clone()
    }

    pub fn session_id(&self) -> u64 {
        self.subscription.session_id()
    }

    pub fn post_state(&self, state: TransportState) -> bool {
        self.subscription.post(TransportEvent::StateChanged(state))
    }

    pub fn post_local_candidate(&self, candidate: IceCandidate) -> bool {
        self.subscription.post(TransportEvent::LocalCandidate(candidate))
    }

    pub fn post_remote_track(&self, track_id: &str) -> bool {
        self.subscription.post(TransportEvent::RemoteTrack {
            track_id: track_id.to_string(),
        })
    }
}

#[derive(Default)]
pub struct FakeTransportFactory {
    handles: Mutex<Vec<FakeHandle>>,
    fail_offers: Arc<AtomicBool>,
    reject_candidate: Arc<Mutex<Option<String>>>,
}

impl FakeTransportFactory {
    pub fn created(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn handles_for(&self, peer: &PeerId) -> Vec<FakeHandle> {
        self.handles
            .lock()
            .unwrap()
            .iter()
            .filter(|h| h.subscription.peer_id() == peer)
            .cloned()
            .collect()
    }

    pub fn last_for(&self, peer: &PeerId) -> FakeHandle {
        self.handles_for(peer)
            .pop()
            .unwrap_or_else(|| panic!("no transport created for {peer}"))
    }

    pub fn fail_offers(&self, fail: bool) {
        self.fail_offers.store(fail, Ordering::SeqCst);
    }

    /// Candidates whose text contains `needle` are rejected by every transport.
    pub fn reject_candidates_containing(&self, needle: &str) {
        *self.reject_candidate.lock().unwrap() = Some(needle.to_string());
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(&self, ctx: TransportContext) -> Result<Box<dyn PeerTransport>, CallError> {
        let record = Arc::new(Mutex::new(TransportRecord {
            peer_id: Some(ctx.peer_id.clone()),
            session_id: ctx.session_id,
            role: Some(ctx.role),
            has_local_tracks: ctx.local_tracks.as_ref().is_some_and(|t| !t.is_empty()),
            ..Default::default()
        }));
        self.handles.lock().unwrap().push(FakeHandle {
            record: record.clone(),
            subscription: ctx.subscription.clone(),
        });
        Ok(Box::new(FakeTransport {
            name: format!("{}-{}", ctx.peer_id, ctx.session_id),
            record,
            fail_offers: self.fail_offers.clone(),
            reject_candidate: self.reject_candidate.clone(),
        }))
    }
}

struct FakeTransport {
    name: String,
    record: Arc<Mutex<TransportRecord>>,
    fail_offers: Arc<AtomicBool>,
    reject_candidate: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription, CallError> {
        if self.fail_offers.load(Ordering::SeqCst) {
            return Err(CallError::Transport("offer refused".into()));
        }
        self.record.lock().unwrap().offers_created += 1;
        Ok(SessionDescription::offer(format!("offer-{}", self.name)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, CallError> {
        let mut record = self.record.lock().unwrap();
        if record.remote_descriptions.is_empty() {
            return Err(CallError::Transport("answer without remote offer".into()));
        }
        record.answers_created += 1;
        Ok(SessionDescription::answer(format!("answer-{}", self.name)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), CallError> {
        self.record.lock().unwrap().remote_descriptions.push(desc);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), CallError> {
        if let Some(needle) = self.reject_candidate.lock().unwrap().as_deref() {
            if candidate.candidate.contains(needle) {
                return Err(CallError::Transport("candidate rejected".into()));
            }
        }
        let mut record = self.record.lock().unwrap();
        if record.remote_descriptions.is_empty() {
            return Err(CallError::Transport("remote description not set".into()));
        }
        record.applied_candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), CallError> {
        self.record.lock().unwrap().close_calls += 1;
        Ok(())
    }
}

/// Media source that is never available.
pub struct NoMicrophone;

#[async_trait]
impl MediaSource for NoMicrophone {
    async fn acquire(&self, _: &MediaConstraints) -> Result<LocalTracks, CallError> {
        Err(CallError::Media("no input device".into()))
    }
}

pub struct Harness {
    pub manager: ConnectionManager,
    pub factory: Arc<FakeTransportFactory>,
    pub signaling: Arc<MemorySignaling>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

impl Harness {
    pub fn new(config: CallConfig) -> Self {
        Self::with_media(config, Arc::new(OpusMicrophone))
    }

    pub fn with_media(config: CallConfig, media: Arc<dyn MediaSource>) -> Self {
        let factory = Arc::new(FakeTransportFactory::default());
        let signaling = Arc::new(MemorySignaling::new());
        let (notifier, events) = Notifier::channel();
        let manager = ConnectionManager::new(
            config,
            factory.clone(),
            signaling.clone(),
            media,
            notifier,
        );
        Self {
            manager,
            factory,
            signaling,
            events,
        }
    }

    /// Outbound invocations for `target`, as (payload, recipient).
    pub fn sent(&self, target: &str) -> Vec<(Value, Value)> {
        self.signaling
            .sent()
            .into_iter()
            .filter(|e| e.target == target)
            .map(|HubEvent { mut args, .. }| {
                assert_eq!(args.len(), 2, "{target} must carry payload and recipient");
                let to = args.pop().unwrap();
                let body = args.pop().unwrap();
                (body, to)
            })
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Joins as `local` with the given occupant ids.
    pub async fn join(&mut self, local: u64, occupants: &[u64], initiate: bool) -> usize {
        let users: Vec<Occupant> = occupants.iter().map(|id| Occupant::new(*id)).collect();
        self.manager
            .reconcile_membership(PeerId::from(local), &users, initiate)
            .await
    }

    /// Reports transport connectivity for the current session of `peer` and processes it.
    pub async fn transport_state(&mut self, peer: u64, state: TransportState) {
        assert!(self.factory.last_for(&PeerId::from(peer)).post_state(state));
        self.manager.process_pending_events().await;
    }

    /// Drives `peer` (which we offered to) all the way to Connected.
    pub async fn connect_initiated(&mut self, peer: u64) {
        let id = PeerId::from(peer);
        self.manager
            .handle_incoming_answer(id, SessionDescription::answer("v=0 answer"))
            .await;
        self.transport_state(peer, TransportState::Connected).await;
    }
}

/// Кандидат конкретного ICE-поколения
pub fn candidate_for(n: u32, ufrag: &str) -> IceCandidate {
    IceCandidate {
        username_fragment: Some(ufrag.to_string()),
        ..candidate(n)
    }
}

/// SDP, несущий только ufrag; фейковому транспорту этого достаточно
pub fn sdp_with_ufrag(ufrag: &str) -> String {
    format!("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=ice-ufrag:{ufrag}\r\n")
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}
