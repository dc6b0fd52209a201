// Конфигурация движка звонка
// Логирование по умолчанию включено только в режиме разработки

use crate::error::ConfigError;
use crate::peer::types::{PeerId, ServerConfig};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const LOGGING_ENABLED: bool = cfg!(debug_assertions);

/// STUN серверы по умолчанию
pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig {
            id: "default-stun".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        ServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
});

/// Ограничения на локальный звук
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Без локального звука сессии не создаются
    pub required: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            required: true,
        }
    }
}

/// Mesh: прямые сессии со всеми; Relay: одна сессия с медиасервером
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NegotiationMode {
    #[default]
    Mesh,
    Relay { relay_id: PeerId },
}

/// Параметры подключения к сигнальному хабу
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub access_token: Option<String>,
    /// Задержки между попытками переподключения; когда кончаются — сдаёмся
    pub reconnect_delays_ms: Vec<u64>,
    pub keep_alive_ms: u64,
    pub server_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/hub".into(),
            access_token: None,
            reconnect_delays_ms: vec![0, 2_000, 10_000, 30_000],
            keep_alive_ms: 15_000,
            server_timeout_ms: 30_000,
        }
    }
}

impl SignalingConfig {
    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub establish_timeout_ms: u64,
    /// None — восстанавливать без ограничений
    pub max_consecutive_recoveries: Option<u32>,
    pub max_buffered_candidates: usize,
    pub media: MediaConstraints,
    pub mode: NegotiationMode,
    pub signaling: SignalingConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            establish_timeout_ms: 20_000,
            max_consecutive_recoveries: Some(3),
            max_buffered_candidates: 64,
            media: MediaConstraints::default(),
            mode: NegotiationMode::Mesh,
            signaling: SignalingConfig::default(),
        }
    }
}

impl CallConfig {
    pub fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    /// Load configuration from a TOML file, falling back to defaults when absent.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: CallConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(ConfigError::Invalid("server URL cannot be empty".into()));
            }
            if server.r#type != "stun" && server.r#type != "turn" {
                return Err(ConfigError::Invalid(format!(
                    "unknown ICE server type '{}'",
                    server.r#type
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(ConfigError::Invalid(
                    "TURN servers require username and credential".into(),
                ));
            }
        }
        if self.establish_timeout_ms == 0 {
            return Err(ConfigError::Invalid("establish timeout must be positive".into()));
        }
        if self.max_buffered_candidates == 0 {
            return Err(ConfigError::Invalid(
                "candidate buffer must hold at least one entry".into(),
            ));
        }
        if let NegotiationMode::Relay {
            relay_id: PeerId::Opaque(id),
        } = &self.mode
        {
            if id.is_empty() {
                return Err(ConfigError::Invalid("relay id cannot be empty".into()));
            }
        }
        Ok(())
    }
}
