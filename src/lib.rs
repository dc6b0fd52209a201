pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod logger;
pub mod manager;
pub mod peer;
pub mod signaling;
pub mod utils;

pub use config::{CallConfig, MediaConstraints, NegotiationMode, SignalingConfig};
pub use engine::{CallEngine, CallHandle, CallSnapshot};
pub use error::{CallError, ConfigError, SignalingError};
pub use logger::{CallEvent, Notifier};
pub use manager::ConnectionManager;
pub use peer::{
    IceCandidate, LocalAudioTrack, Occupant, OpusMicrophone, PeerId, PeerSnapshot, RemoteAudioFrame,
    Role, Room, SessionDescription, SessionState, TransportState, WebRtcTransportFactory,
};
pub use signaling::{HubConnection, HubState, MemorySignaling, SignalingChannel};
