use crate::logger::dump_candidate;
use crate::peer::transport::PeerTransport;
use crate::peer::types::{IceCandidate, PeerId, ServerConfig};
use crate::utils::add_ice_url_scheme;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::{
    api::APIBuilder,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::configuration::RTCConfiguration,
};

#[derive(Debug)]
struct PendingQueue {
    candidates: VecDeque<IceCandidate>,
    touched: Instant,
}

/// Кандидаты, полученные до установки remote description, по участникам.
/// Очереди участников без сессии живут не дольше `ttl` с последнего пополнения;
/// недавно закрытые сессии помнятся столько же.
#[derive(Debug)]
pub struct CandidateBuffer {
    capacity: usize,
    ttl: Duration,
    pending: HashMap<PeerId, PendingQueue>,
    closed: HashMap<PeerId, Instant>,
}

impl CandidateBuffer {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            pending: HashMap::new(),
            closed: HashMap::new(),
        }
    }

    /// Ставит кандидата в очередь. При переполнении выбрасывает самый старый и возвращает false.
    pub fn push(&mut self, peer_id: &PeerId, candidate: IceCandidate) -> bool {
        let now = Instant::now();
        let queue = self
            .pending
            .entry(peer_id.clone())
            .or_insert_with(|| PendingQueue {
                candidates: VecDeque::new(),
                touched: now,
            });
        queue.touched = now;
        let mut kept_all = true;
        if queue.candidates.len() >= self.capacity {
            queue.candidates.pop_front();
            kept_all = false;
            log::warn!(
                "Candidate buffer for {peer_id} is full ({}), dropping oldest",
                self.capacity
            );
        }
        queue.candidates.push_back(candidate);
        kept_all
    }

    /// Забирает очередь целиком, в порядке поступления
    pub fn take(&mut self, peer_id: &PeerId) -> Vec<IceCandidate> {
        self.pending
            .remove(peer_id)
            .map(|q| Vec::from(q.candidates))
            .unwrap_or_default()
    }

    pub fn discard(&mut self, peer_id: &PeerId) -> usize {
        self.pending
            .remove(peer_id)
            .map(|q| q.candidates.len())
            .unwrap_or(0)
    }

    /// Сессия участника закрыта: очередь выбрасывается, закрытие запоминается на `ttl`
    pub fn close(&mut self, peer_id: &PeerId) -> usize {
        self.closed.insert(peer_id.clone(), Instant::now());
        self.discard(peer_id)
    }

    /// Новая сессия с участником
    pub fn reopen(&mut self, peer_id: &PeerId) {
        self.closed.remove(peer_id);
    }

    pub fn recently_closed(&self, peer_id: &PeerId) -> bool {
        self.closed
            .get(peer_id)
            .is_some_and(|at| at.elapsed() < self.ttl)
    }

    /// Выбрасывает очереди участников без сессии, которые не пополнялись дольше `ttl`.
    /// Возвращает число выброшенных очередей.
    pub fn expire(&mut self, has_session: impl Fn(&PeerId) -> bool) -> usize {
        let ttl = self.ttl;
        let before = self.pending.len();
        self.pending
            .retain(|peer_id, q| has_session(peer_id) || q.touched.elapsed() < ttl);
        self.closed.retain(|_, at| at.elapsed() < ttl);
        before - self.pending.len()
    }

    pub fn len(&self, peer_id: &PeerId) -> usize {
        self.pending
            .get(peer_id)
            .map(|q| q.candidates.len())
            .unwrap_or(0)
    }

    pub fn peer_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.closed.clear();
    }
}

/// Кандидат другого ICE-поколения: его ufrag не совпадает с ufrag remote description.
/// Без ufrag с одной из сторон сравнивать нечего.
pub fn matches_ufrag(candidate: &IceCandidate, remote_ufrag: Option<&str>) -> bool {
    match (candidate.username_fragment.as_deref(), remote_ufrag) {
        (Some(theirs), Some(expected)) => theirs == expected,
        _ => true,
    }
}

/// Применяет отложенные кандидаты после установки remote description.
/// Кандидаты чужого поколения пропускаются; ошибка на отдельном кандидате
/// логируется и не прерывает остальные.
pub async fn apply_pending_candidates(
    transport: &dyn PeerTransport,
    peer_id: &PeerId,
    candidates: Vec<IceCandidate>,
    remote_ufrag: Option<&str>,
) -> usize {
    let total = candidates.len();
    let mut applied = 0;
    for candidate in candidates {
        if !matches_ufrag(&candidate, remote_ufrag) {
            log::debug!(
                "Skipping pending candidate from {peer_id} with stale ufrag {:?}",
                candidate.username_fragment
            );
            continue;
        }
        dump_candidate("PENDING", peer_id, &candidate);
        match transport.add_remote_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Failed to apply pending candidate from {peer_id}: {e}"),
        }
    }
    if total > 0 {
        log::debug!("Applied {applied}/{total} buffered candidates for {peer_id}");
    }
    applied
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        match candidate.kind() {
            Some("host") => host_count += 1,
            Some("srflx") => srflx_count += 1,
            Some("relay") => relay_count += 1,
            _ => {}
        }
    }

    log::debug!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count,
        srflx_count,
        relay_count
    );
}

/// Проверяет, что STUN/TURN сервер отвечает: ждём srflx (STUN) или relay (TURN) кандидата
pub async fn probe_ice_server(config: &ServerConfig, wait: Duration) -> bool {
    let url = add_ice_url_scheme(config);
    log::debug!("Probing ICE server '{}' -> '{}'", config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };

    let api = APIBuilder::new().build();
    let pc = match api.new_peer_connection(rtc_config).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            log::warn!("Failed to create probe peer connection: {e}");
            return false;
        }
    };

    let wanted = if config.r#type == "turn" { "relay" } else { "srflx" };
    let (tx, mut rx) = mpsc::channel::<()>(1);
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(c) = cand {
                if let Ok(init) = c.to_json() {
                    if IceCandidate::from(init).kind() == Some(wanted) {
                        let _ = tx.try_send(());
                    }
                }
            }
        })
    }));

    // data channel нужен только чтобы запустить сбор кандидатов
    if let Err(e) = pc.create_data_channel("probe", None).await {
        log::warn!("Failed to create probe data channel: {e}");
        let _ = pc.close().await;
        return false;
    }
    let started = match pc.create_offer(None).await {
        Ok(offer) => pc.set_local_description(offer).await.is_ok(),
        Err(_) => false,
    };

    let found = started && matches!(timeout(wait, rx.recv()).await, Ok(Some(())));
    log::debug!("Probe of '{}' finished: reachable={found}", config.url);
    let _ = pc.close().await;
    found
}
