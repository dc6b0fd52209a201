use super::protocol::{self, HubMessage};
use super::{HandlerRegistry, SignalingChannel, Subscription};
use crate::config::SignalingConfig;
use crate::error::SignalingError;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Клиент хаба поверх WebSocket. Переподключается сам, исходящие вызовы копятся в очереди.
pub struct HubConnection {
    config: SignalingConfig,
    registry: HandlerRegistry,
    state: Arc<watch::Sender<HubState>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

/// ws(s) адрес хаба с токеном доступа в query, как это делает браузерный клиент
pub fn endpoint_url(config: &SignalingConfig) -> Result<Url, SignalingError> {
    let mut url = Url::parse(&config.url)?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => {
            return Err(SignalingError::Protocol(format!(
                "unsupported hub url scheme '{other}'"
            )))
        }
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::Protocol("cannot switch url scheme".into()))?;
    }
    if let Some(token) = &config.access_token {
        url.query_pairs_mut().append_pair("access_token", token);
    }
    Ok(url)
}

impl HubConnection {
    pub fn new(config: SignalingConfig) -> Self {
        let (state, _) = watch::channel(HubState::Disconnected);
        Self {
            config,
            registry: HandlerRegistry::new(),
            state: Arc::new(state),
            outbound: Mutex::new(None),
            driver: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HubState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<HubState> {
        self.state.subscribe()
    }

    /// Подключается и выполняет рукопожатие; дальше соединение поддерживает фоновая задача
    pub async fn start(&self) -> Result<(), SignalingError> {
        self.stop();
        self.state.send_replace(HubState::Connecting);

        let ws = match connect(&self.config, &self.registry).await {
            Ok(ws) => ws,
            Err(e) => {
                self.state.send_replace(HubState::Disconnected);
                return Err(e);
            }
        };
        log::info!("Connected to signaling hub {}", self.config.url);
        self.state.send_replace(HubState::Connected);

        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        let driver = tokio::spawn(drive(
            ws,
            rx,
            self.config.clone(),
            self.registry.clone(),
            self.state.clone(),
        ));
        *self.driver.lock().unwrap_or_else(|e| e.into_inner()) = Some(driver);
        Ok(())
    }

    /// Останавливает соединение. Подписки остаются и снова заработают после `start`.
    pub fn stop(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(driver) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            driver.abort();
            log::info!("Signaling hub connection stopped");
        }
        self.state.send_replace(HubState::Disconnected);
    }

    pub fn invoke(&self, target: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        let frame = protocol::encode_invocation(target, args)?;
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| SignalingError::Closed),
            None => Err(SignalingError::Closed),
        }
    }

    /// Команды комнаты для прикладного слоя; движок их не вызывает
    pub fn join_room<T: Serialize>(&self, room_id: T) -> Result<(), SignalingError> {
        self.invoke("JoinRoom", vec![serde_json::to_value(room_id)?])
    }

    pub fn leave_room(&self) -> Result<(), SignalingError> {
        self.invoke("LeaveRoom", Vec::new())
    }
}

impl Drop for HubConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().unwrap_or_else(|e| e.into_inner()).take() {
            driver.abort();
        }
    }
}

impl SignalingChannel for HubConnection {
    fn send(&self, target: &str, args: Vec<Value>) -> Result<(), SignalingError> {
        self.invoke(target, args)
    }

    fn subscribe(&self, targets: &[&str]) -> Subscription {
        self.registry.subscribe(targets)
    }
}

async fn connect(config: &SignalingConfig, registry: &HandlerRegistry) -> Result<WsStream, SignalingError> {
    let url = endpoint_url(config)?;
    let (mut ws, _) = connect_async(url.as_str()).await?;
    ws.send(Message::Text(protocol::handshake_request())).await?;

    let wait = std::time::Duration::from_millis(config.server_timeout_ms);
    let reply = timeout(wait, ws.next())
        .await
        .map_err(|_| SignalingError::Handshake("no handshake response".into()))?;
    match reply {
        Some(Ok(Message::Text(text))) => {
            let mut frames = protocol::split_frames(&text);
            let handshake = frames
                .next()
                .ok_or_else(|| SignalingError::Handshake("empty handshake response".into()))?;
            protocol::parse_handshake_response(handshake)?;
            // сервер может прислать первые сообщения тем же кадром
            for frame in frames {
                handle_frame(frame, registry);
            }
            Ok(ws)
        }
        Some(Ok(other)) => Err(SignalingError::Handshake(format!(
            "unexpected handshake frame: {other:?}"
        ))),
        Some(Err(e)) => Err(e.into()),
        None => Err(SignalingError::Closed),
    }
}

/// `Some(allow_reconnect)`, если сервер прислал close
fn handle_frame(frame: &str, registry: &HandlerRegistry) -> Option<bool> {
    match protocol::decode(frame) {
        Ok(HubMessage::Invocation { target, arguments }) => {
            log::debug!("hub <- {target} ({} arg(s))", arguments.len());
            registry.dispatch(&target, arguments);
            None
        }
        Ok(HubMessage::Ping) => None,
        Ok(HubMessage::Close {
            error,
            allow_reconnect,
        }) => {
            log::warn!("Hub closed the connection: {:?}", error);
            Some(allow_reconnect)
        }
        Ok(HubMessage::Other(kind)) => {
            log::debug!("Ignoring hub message of type {kind}");
            None
        }
        Err(e) => {
            log::warn!("Dropping malformed hub frame: {e}");
            None
        }
    }
}

/// Одна жизнь WebSocket-соединения. Возвращает true, если стоит переподключаться.
async fn run_session(
    ws: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    config: &SignalingConfig,
    registry: &HandlerRegistry,
) -> bool {
    let (mut write, mut read) = ws.split();
    let server_timeout = std::time::Duration::from_millis(config.server_timeout_ms);
    let mut keep_alive = interval(std::time::Duration::from_millis(config.keep_alive_ms.max(1)));
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keep_alive.tick().await;
    let mut deadline = Instant::now() + server_timeout;

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    deadline = Instant::now() + server_timeout;
                    for frame in protocol::split_frames(&text) {
                        if let Some(allow_reconnect) = handle_frame(frame, registry) {
                            return allow_reconnect;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::warn!("Signaling websocket closed");
                    return true;
                }
                Some(Ok(Message::Binary(_))) => {
                    log::warn!("Binary hub frames are not supported, dropping");
                }
                Some(Ok(_)) => {
                    deadline = Instant::now() + server_timeout;
                }
                Some(Err(e)) => {
                    log::warn!("Signaling websocket error: {e}");
                    return true;
                }
            },
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write.send(Message::Text(frame)).await {
                        log::warn!("Failed to send hub invocation: {e}");
                        return true;
                    }
                }
                None => {
                    let _ = write.close().await;
                    return false;
                }
            },
            _ = keep_alive.tick() => {
                if write.send(Message::Text(protocol::encode_ping())).await.is_err() {
                    return true;
                }
            }
            _ = sleep_until(deadline) => {
                log::warn!("No message from hub for {:?}, reconnecting", server_timeout);
                return true;
            }
        }
    }
}

async fn drive(
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    config: SignalingConfig,
    registry: HandlerRegistry,
    state: Arc<watch::Sender<HubState>>,
) {
    loop {
        if !run_session(ws, &mut outbound, &config, &registry).await {
            state.send_replace(HubState::Disconnected);
            return;
        }

        state.send_replace(HubState::Reconnecting);
        let mut reconnected = None;
        for (attempt, delay) in config.reconnect_delays().into_iter().enumerate() {
            sleep(delay).await;
            match connect(&config, &registry).await {
                Ok(stream) => {
                    log::info!("Reconnected to signaling hub (attempt {})", attempt + 1);
                    reconnected = Some(stream);
                    break;
                }
                Err(e) => log::warn!("Reconnect attempt {} failed: {e}", attempt + 1),
            }
        }

        match reconnected {
            Some(stream) => {
                state.send_replace(HubState::Connected);
                ws = stream;
            }
            None => {
                log::error!("Giving up on signaling hub {}", config.url);
                state.send_replace(HubState::Disconnected);
                return;
            }
        }
    }
}
