use crate::config::{CallConfig, NegotiationMode};
use crate::error::CallError;
use crate::health::{HealthMonitor, Recovery};
use crate::logger::{dump_candidate, Notifier};
use crate::peer::ice::{analyze_candidates, apply_pending_candidates, matches_ufrag, CandidateBuffer};
use crate::peer::media::{LocalMedia, LocalTracks, MediaSource};
use crate::peer::session::{PeerSession, PeerSnapshot};
use crate::peer::state::{SessionState, TransportState};
use crate::peer::transport::{
    EngineEvent, EngineEventTx, TransportContext, TransportEvent, TransportFactory,
    TransportSubscription,
};
use crate::peer::types::{IceCandidate, Occupant, PeerId, Role, Room, SessionDescription, SignalPayload};
use crate::signaling::{HubEvent, InboundSignal, SignalingChannel};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Единственный владелец таблицы сессий. Все входы через `&mut self`,
/// события для заменённых или удалённых сессий отбрасываются.
pub struct ConnectionManager {
    config: CallConfig,
    notifier: Notifier,
    factory: Arc<dyn TransportFactory>,
    signaling: Arc<dyn SignalingChannel>,
    media: LocalMedia,
    sessions: HashMap<PeerId, PeerSession>,
    candidates: CandidateBuffer,
    health: HealthMonitor,
    events_tx: EngineEventTx,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    next_session_id: u64,
    local_id: Option<PeerId>,
}

impl ConnectionManager {
    pub fn new(
        config: CallConfig,
        factory: Arc<dyn TransportFactory>,
        signaling: Arc<dyn SignalingChannel>,
        media_source: Arc<dyn MediaSource>,
        notifier: Notifier,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            media: LocalMedia::new(media_source, config.media.clone()),
            candidates: CandidateBuffer::new(config.max_buffered_candidates, config.establish_timeout()),
            health: HealthMonitor::new(config.establish_timeout(), config.max_consecutive_recoveries),
            config,
            notifier,
            factory,
            signaling,
            sessions: HashMap::new(),
            events_tx,
            events_rx,
            next_session_id: 0,
            local_id: None,
        }
    }

    // ---------------------------------------------------------------------
    // membership
    // ---------------------------------------------------------------------

    /// Создаёт недостающие сессии; существующие не трогает и ничего не удаляет.
    /// Свой id запоминается при первом вызове и дальше не меняется до выхода из комнаты.
    /// Возвращает число созданных сессий.
    pub async fn reconcile_membership(
        &mut self,
        current_user_id: PeerId,
        occupants: &[Occupant],
        local_initiates: bool,
    ) -> usize {
        match &self.local_id {
            None => self.local_id = Some(current_user_id),
            Some(local) if *local != current_user_id => {
                log::warn!("Membership for {current_user_id} while joined as {local}, keeping {local}");
            }
            Some(_) => {}
        }
        let mut created = 0;

        for (peer_id, role) in self.negotiation_targets(occupants, local_initiates) {
            if self.sessions.contains_key(&peer_id) {
                continue;
            }
            match self.create_session(&peer_id, role).await {
                Ok(()) => created += 1,
                Err(CallError::Media(e)) => {
                    log::error!("Not creating sessions without local media: {e}");
                    break;
                }
                Err(e) => {
                    log::warn!("Failed to create session for {peer_id}: {e}");
                    continue;
                }
            }
            if role == Role::Initiator {
                self.start_offer(&peer_id).await;
            }
        }
        created
    }

    /// Mesh: все, кроме себя; Relay: только медиасервер, и всегда мы предлагаем
    fn negotiation_targets(&self, occupants: &[Occupant], local_initiates: bool) -> Vec<(PeerId, Role)> {
        match &self.config.mode {
            NegotiationMode::Mesh => {
                let role = if local_initiates {
                    Role::Initiator
                } else {
                    Role::Responder
                };
                occupants
                    .iter()
                    .filter(|o| Some(&o.id) != self.local_id.as_ref())
                    .map(|o| (o.id.clone(), role))
                    .collect()
            }
            NegotiationMode::Relay { relay_id } => vec![(relay_id.clone(), Role::Initiator)],
        }
    }

    /// Переподключившийся участник: его старая сессия устарела, предлагать будет он сам.
    /// Если переподключились мы, досоздаём сессии и предлагаем сами.
    pub async fn handle_rejoin(&mut self, occupant: Occupant, room: Room) -> usize {
        if Some(&occupant.id) == self.local_id.as_ref() {
            log::info!("Rejoined room {} as {}", room.id, occupant.id);
            return self.reconcile_membership(occupant.id, &room.users, true).await;
        }

        let Some(local_id) = self.local_id.clone() else {
            log::warn!("Rejoin of {} before joining any room, ignoring", occupant.id);
            return 0;
        };
        if matches!(self.config.mode, NegotiationMode::Mesh) {
            self.remove_session(&occupant.id).await;
        }
        self.reconcile_membership(local_id, &room.users, false).await
    }

    /// JoinedRoom: либо вошли мы (первое событие, или наш же id), либо в комнату вошёл
    /// кто-то другой. Во втором случае сверяемся с `room.users` от своего имени.
    async fn handle_joined(&mut self, occupant: Occupant, room: Room, should_initiate: bool) -> usize {
        match self.local_id.clone() {
            Some(local_id) if local_id != occupant.id => {
                log::info!(
                    "{} joined room {} ({} occupant(s))",
                    occupant.id,
                    room.id,
                    room.users.len()
                );
                let mut users = room.users;
                if !users.iter().any(|u| u.id == occupant.id) {
                    users.push(occupant);
                }
                self.reconcile_membership(local_id, &users, should_initiate).await
            }
            _ => {
                log::info!(
                    "Joined room {} as {} ({} occupant(s), initiate={should_initiate})",
                    room.id,
                    occupant.id,
                    room.users.len()
                );
                self.reconcile_membership(occupant.id, &room.users, should_initiate)
                    .await
            }
        }
    }

    async fn handle_leave(&mut self, occupant: Occupant) {
        if Some(&occupant.id) == self.local_id.as_ref() {
            log::info!("Local user left the room, tearing the call down");
            self.teardown_all().await;
            self.local_id = None;
            return;
        }
        match &self.config.mode {
            NegotiationMode::Mesh => {
                self.remove_session(&occupant.id).await;
            }
            NegotiationMode::Relay { .. } => {
                log::debug!("{} left; relay session stays", occupant.id);
            }
        }
    }

    // ---------------------------------------------------------------------
    // negotiation
    // ---------------------------------------------------------------------

    pub async fn handle_incoming_offer(&mut self, from: PeerId, offer: SessionDescription) {
        match self.sessions.get(&from).map(PeerSession::state) {
            None => {
                if let Err(e) = self.create_session(&from, Role::Responder).await {
                    log::warn!("Cannot answer offer from {from}: {e}");
                    return;
                }
            }
            Some(SessionState::OfferSent) => {
                if !self.is_polite(&from) {
                    log::info!("Glare with {from}: keeping our offer, ignoring theirs");
                    // кандидаты от их отброшенного offer нам не нужны
                    self.candidates.discard(&from);
                    return;
                }
                log::info!("Glare with {from}: yielding and answering their offer");
                if let Some(session) = self.sessions.remove(&from) {
                    session.close().await;
                }
                if let Err(e) = self.create_session(&from, Role::Responder).await {
                    log::warn!("Cannot answer offer from {from}: {e}");
                    return;
                }
            }
            Some(state @ (SessionState::OfferReceived | SessionState::AnswerSent)) => {
                log::debug!("Duplicate offer from {from} in {state:?}, ignoring");
                return;
            }
            Some(SessionState::Created | SessionState::AnswerReceived | SessionState::Connected) => {}
            Some(state) => {
                log::warn!("Offer from {from} for a {state:?} session, ignoring");
                return;
            }
        }

        match self.answer_offer(&from, offer).await {
            Ok(answer) => self.send_signal(&from, SignalPayload::Answer(answer)),
            Err(e) => self.fail_session(&from, e).await,
        }
    }

    async fn answer_offer(
        &mut self,
        from: &PeerId,
        offer: SessionDescription,
    ) -> Result<SessionDescription, CallError> {
        let session = self
            .sessions
            .get_mut(from)
            .ok_or_else(|| CallError::NoSession(from.clone()))?;
        let renegotiating = session.state() == SessionState::Connected;
        let ufrag = offer.ice_ufrag().map(str::to_owned);

        session.transport.set_remote_description(offer).await?;
        session.remote_ufrag = ufrag;
        if !renegotiating {
            session.transition(SessionState::OfferReceived)?;
        }
        let pending = self.candidates.take(from);
        apply_pending_candidates(
            session.transport.as_ref(),
            from,
            pending,
            session.remote_ufrag.as_deref(),
        )
        .await;

        let answer = session.transport.create_answer().await?;
        if renegotiating {
            session.renegotiations += 1;
            log::info!(
                "Renegotiated with {from} (round {})",
                session.renegotiations
            );
        } else {
            session.transition(SessionState::AnswerSent)?;
        }
        Ok(answer)
    }

    pub async fn handle_incoming_answer(&mut self, from: PeerId, answer: SessionDescription) {
        match self.sessions.get(&from).map(PeerSession::state) {
            Some(SessionState::OfferSent) => {}
            Some(state) => {
                log::warn!("Answer from {from} while {state:?}, ignoring");
                return;
            }
            None => {
                log::warn!("Answer from {from} without a session, ignoring");
                return;
            }
        }
        if let Err(e) = self.accept_answer(&from, answer).await {
            self.fail_session(&from, e).await;
        }
    }

    async fn accept_answer(&mut self, from: &PeerId, answer: SessionDescription) -> Result<(), CallError> {
        let session = self
            .sessions
            .get_mut(from)
            .ok_or_else(|| CallError::NoSession(from.clone()))?;
        let ufrag = answer.ice_ufrag().map(str::to_owned);
        session.transport.set_remote_description(answer).await?;
        session.remote_ufrag = ufrag;
        session.transition(SessionState::AnswerReceived)?;
        let pending = self.candidates.take(from);
        apply_pending_candidates(
            session.transport.as_ref(),
            from,
            pending,
            session.remote_ufrag.as_deref(),
        )
        .await;
        Ok(())
    }

    /// Кандидат применяется сразу, если есть remote description, иначе ждёт в буфере.
    /// Опоздавшие кандидаты только что закрытой сессии и кандидаты чужого ICE-поколения
    /// отбрасываются.
    pub async fn handle_incoming_candidate(&mut self, from: PeerId, candidate: IceCandidate) {
        let sessions = &self.sessions;
        let expired = self.candidates.expire(|peer_id| sessions.contains_key(peer_id));
        if expired > 0 {
            log::debug!("Expired {expired} orphaned candidate queue(s)");
        }

        match self.sessions.get(&from) {
            Some(session) if session.has_remote_description() => {
                if !matches_ufrag(&candidate, session.remote_ufrag.as_deref()) {
                    log::debug!(
                        "Dropping candidate from {from} for a previous ICE generation ({:?})",
                        candidate.username_fragment
                    );
                    return;
                }
                dump_candidate("REMOTE", &from, &candidate);
                if let Err(e) = session.transport.add_remote_candidate(candidate).await {
                    log::warn!("Failed to add candidate from {from}: {e}");
                }
            }
            None if candidate.username_fragment.is_none() && self.candidates.recently_closed(&from) => {
                log::debug!("Dropping late candidate from {from}: its session was just closed");
            }
            _ => {
                self.candidates.push(&from, candidate);
                log::debug!(
                    "Buffered candidate from {from} ({} pending)",
                    self.candidates.len(&from)
                );
            }
        }
    }

    async fn start_offer(&mut self, peer_id: &PeerId) {
        let result = match self.sessions.get_mut(peer_id) {
            Some(session) => match session.transport.create_offer().await {
                Ok(offer) => session.transition(SessionState::OfferSent).map(|()| offer),
                Err(e) => Err(e),
            },
            None => return,
        };
        match result {
            Ok(offer) => self.send_signal(peer_id, SignalPayload::Offer(offer)),
            Err(e) => self.fail_session(peer_id, e).await,
        }
    }

    fn send_signal(&self, to: &PeerId, payload: SignalPayload) {
        let args = match (payload.to_value(), serde_json::to_value(to)) {
            (Ok(body), Ok(recipient)) => vec![body, recipient],
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to encode {} for {to}: {e}", payload.target());
                return;
            }
        };
        if let Err(e) = self.signaling.send(payload.target(), args) {
            log::warn!("Failed to send {} to {to}: {e}", payload.target());
        }
    }

    /// В отношении glare вежлива сторона с меньшим id; без своего id уступаем мы
    fn is_polite(&self, remote: &PeerId) -> bool {
        match &self.local_id {
            Some(local) => local < remote,
            None => true,
        }
    }

    // ---------------------------------------------------------------------
    // session lifecycle
    // ---------------------------------------------------------------------

    async fn create_session(&mut self, peer_id: &PeerId, role: Role) -> Result<(), CallError> {
        let local_tracks = match self.media.ensure().await {
            Ok(tracks) => Some(tracks),
            Err(e) if self.media.is_required() => {
                self.notifier.emit_call_failed(e.to_string());
                return Err(e);
            }
            Err(e) => {
                log::warn!("Continuing without local audio: {e}");
                None
            }
        };

        self.next_session_id += 1;
        let id = self.next_session_id;
        let subscription = TransportSubscription::new(peer_id.clone(), id, self.events_tx.clone());
        let ctx = TransportContext {
            peer_id: peer_id.clone(),
            session_id: id,
            role,
            local_tracks: local_tracks.clone(),
            subscription: subscription.clone(),
        };
        let transport = match self.factory.create(ctx).await {
            Ok(transport) => transport,
            Err(e) => {
                subscription.dispose();
                return Err(e);
            }
        };

        let timer = self.health.arm(peer_id, id, &self.events_tx);
        let session = PeerSession::new(
            peer_id.clone(),
            id,
            role,
            transport,
            local_tracks,
            subscription,
            timer,
        );
        log::info!("Session {peer_id}#{id} created as {role:?}");
        self.candidates.reopen(peer_id);
        self.sessions.insert(peer_id.clone(), session);
        self.notifier.emit_connecting(peer_id);
        Ok(())
    }

    async fn fail_session(&mut self, peer_id: &PeerId, error: CallError) {
        log::warn!("Session with {peer_id} failed: {error}");
        if let Some(mut session) = self.sessions.remove(peer_id) {
            if let Err(e) = session.transition(SessionState::Failed) {
                log::debug!("{e}");
            }
            session.close().await;
            self.candidates.close(peer_id);
            self.notifier.emit_removed(peer_id);
        } else {
            self.candidates.discard(peer_id);
        }
    }

    /// Idempotent. Returns whether a session was actually removed.
    pub async fn remove_session(&mut self, peer_id: &PeerId) -> bool {
        let session = self.sessions.remove(peer_id);
        let dropped = match session {
            Some(_) => self.candidates.close(peer_id),
            None => self.candidates.discard(peer_id),
        };
        if dropped > 0 {
            log::debug!("Discarded {dropped} buffered candidate(s) for {peer_id}");
        }
        self.health.forget(peer_id);
        match session {
            Some(session) => {
                log::info!("Removing session {peer_id}#{}", session.id());
                session.close().await;
                self.notifier.emit_removed(peer_id);
                true
            }
            None => false,
        }
    }

    /// Закрывает все сессии, затем один раз останавливает локальные треки
    pub async fn teardown_all(&mut self) {
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer_id in peers {
            self.remove_session(&peer_id).await;
        }
        self.candidates.clear();
        self.health.clear();
        self.media.release();
    }

    pub fn set_outbound_muted(&mut self, muted: bool) -> bool {
        let applied = self.media.set_muted(muted);
        log::info!(
            "Outbound audio {} across {} session(s)",
            if applied { "muted" } else { "unmuted" },
            self.sessions.len()
        );
        self.notifier.emit_mute_changed(applied);
        applied
    }

    // ---------------------------------------------------------------------
    // transport callbacks and timers
    // ---------------------------------------------------------------------

    fn is_current(&self, peer_id: &PeerId, session_id: u64) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|s| s.id() == session_id)
    }

    pub async fn handle_transport_event(&mut self, peer_id: PeerId, session_id: u64, event: TransportEvent) {
        if !self.is_current(&peer_id, session_id) {
            log::debug!("Dropping stale transport event for {peer_id}#{session_id}: {event:?}");
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Some(session) = self.sessions.get_mut(&peer_id) {
                    session.local_candidates.push(candidate.clone());
                }
                self.send_signal(&peer_id, SignalPayload::Candidate(candidate));
            }
            TransportEvent::RemoteTrack { track_id } => {
                self.notifier.emit_remote_track(&peer_id, track_id);
            }
            TransportEvent::StateChanged(state) => self.on_transport_state(&peer_id, state).await,
        }
    }

    async fn on_transport_state(&mut self, peer_id: &PeerId, state: TransportState) {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            return;
        };
        let previous = std::mem::replace(&mut session.transport_state, state);
        let connected = session.state() == SessionState::Connected;

        match state {
            TransportState::Connected if connected => {
                if previous == TransportState::Disconnected {
                    self.notifier.emit_connection_recovered(peer_id);
                }
            }
            TransportState::Connected => match session.transition(SessionState::Connected) {
                Ok(()) => {
                    session.establish_timer.cancel();
                    analyze_candidates(&session.local_candidates);
                    self.health.on_connected(peer_id);
                    self.notifier.emit_connected(peer_id);
                }
                Err(e) => log::warn!("Transport for {peer_id} connected early: {e}"),
            },
            TransportState::Disconnected if connected => {
                self.notifier.emit_connection_problem(peer_id);
            }
            TransportState::Failed if connected => self.recover(peer_id).await,
            TransportState::Failed => {
                if self.health.attempts(peer_id) > 0 {
                    self.recover(peer_id).await;
                } else {
                    self.fail_session(
                        peer_id,
                        CallError::Transport("connectivity failed before connecting".into()),
                    )
                    .await;
                }
            }
            _ => {}
        }
    }

    /// Заменяет отказавшую сессию новой (мы предлагаем) или сдаётся по достижении лимита
    async fn recover(&mut self, peer_id: &PeerId) {
        if let Some(mut session) = self.sessions.remove(peer_id) {
            if let Err(e) = session.transition(SessionState::Failed) {
                log::debug!("{e}");
            }
            session.close().await;
        }
        self.candidates.discard(peer_id);

        match self.health.on_failure(peer_id) {
            Recovery::Replace { attempt } => {
                log::warn!("Connection to {peer_id} failed, replacing session (attempt {attempt})");
                match self.create_session(peer_id, Role::Initiator).await {
                    Ok(()) => self.start_offer(peer_id).await,
                    Err(e) => log::warn!("Could not replace session for {peer_id}: {e}"),
                }
            }
            Recovery::GiveUp { attempts } => {
                self.notifier.emit_lost(peer_id, attempts);
            }
        }
    }

    pub async fn handle_establish_timeout(&mut self, peer_id: PeerId, session_id: u64) {
        if !self.is_current(&peer_id, session_id) {
            log::debug!("Stale establish timeout for {peer_id}#{session_id}");
            return;
        }
        let Some(mut session) = self.sessions.remove(&peer_id) else {
            return;
        };
        if session.state() == SessionState::Connected {
            self.sessions.insert(peer_id, session);
            return;
        }
        log::warn!(
            "Session with {peer_id} not connected within {:?} (state {:?}), removing",
            self.health.establish_timeout(),
            session.state()
        );
        if let Err(e) = session.transition(SessionState::Failed) {
            log::debug!("{e}");
        }
        session.close().await;
        self.candidates.close(&peer_id);
        self.health.forget(&peer_id);
        self.notifier.emit_timed_out(&peer_id);
    }

    pub async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Transport {
                peer_id,
                session_id,
                event,
            } => self.handle_transport_event(peer_id, session_id, event).await,
            EngineEvent::EstablishTimeout {
                peer_id,
                session_id,
            } => self.handle_establish_timeout(peer_id, session_id).await,
        }
    }

    /// Ждёт следующее внутреннее событие (колбэк транспорта или таймер)
    pub async fn next_engine_event(&mut self) -> Option<EngineEvent> {
        self.events_rx.recv().await
    }

    /// Обрабатывает всё, что уже накопилось в очереди, не дожидаясь новых событий
    pub async fn process_pending_events(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_engine_event(event).await;
            handled += 1;
        }
        handled
    }

    pub fn event_sender(&self) -> EngineEventTx {
        self.events_tx.clone()
    }

    // ---------------------------------------------------------------------
    // inbound signaling
    // ---------------------------------------------------------------------

    pub async fn dispatch(&mut self, signal: InboundSignal) {
        match signal {
            InboundSignal::JoinedRoom {
                occupant,
                room,
                should_initiate,
            } => {
                self.handle_joined(occupant, room, should_initiate).await;
            }
            InboundSignal::LeavedRoom { occupant, .. } => self.handle_leave(occupant).await,
            InboundSignal::RejoinedRoom { occupant, room } => {
                self.handle_rejoin(occupant, room).await;
            }
            InboundSignal::Offer { from, offer } => self.handle_incoming_offer(from, offer).await,
            InboundSignal::Answer { from, answer } => {
                self.handle_incoming_answer(from, answer).await
            }
            InboundSignal::Candidate { from, candidate } => {
                self.handle_incoming_candidate(from, candidate).await
            }
        }
    }

    /// Разбирает и обрабатывает вызов хаба; битые сообщения логируются и отбрасываются
    pub async fn handle_hub_event(&mut self, event: &HubEvent) {
        match InboundSignal::parse(event) {
            Ok(Some(signal)) => self.dispatch(signal).await,
            Ok(None) => {}
            Err(e) => log::warn!("Dropping malformed '{}' message: {e}", event.target),
        }
    }

    // ---------------------------------------------------------------------
    // read accessors
    // ---------------------------------------------------------------------

    pub fn session_state(&self, peer_id: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer_id).map(PeerSession::state)
    }

    pub fn session_role(&self, peer_id: &PeerId) -> Option<Role> {
        self.sessions.get(peer_id).map(PeerSession::role)
    }

    pub fn session_id(&self, peer_id: &PeerId) -> Option<u64> {
        self.sessions.get(peer_id).map(PeerSession::id)
    }

    pub fn pending_candidates(&self, peer_id: &PeerId) -> usize {
        self.candidates.len(peer_id)
    }

    /// Сколько участников сейчас имеют очередь отложенных кандидатов
    pub fn buffered_peer_count(&self) -> usize {
        self.candidates.peer_count()
    }

    pub fn recovery_attempts(&self, peer_id: &PeerId) -> u32 {
        self.health.attempts(peer_id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        let mut snapshot: Vec<PeerSnapshot> =
            self.sessions.values().map(PeerSession::snapshot).collect();
        snapshot.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        snapshot
    }

    pub fn is_muted(&self) -> bool {
        self.media.is_muted()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn local_tracks(&self) -> Option<LocalTracks> {
        self.media.tracks().cloned()
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }
}
