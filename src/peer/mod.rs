pub mod connection;
pub mod ice;
pub mod media;
pub mod session;
pub mod state;
pub mod transport;
pub mod types;

pub use connection::{RemoteAudioFrame, RemoteAudioSink, WebRtcTransportFactory};
pub use media::{LocalAudioTrack, LocalMedia, LocalTracks, MediaSource, OpusMicrophone};
pub use session::{PeerSession, PeerSnapshot};
pub use state::{SessionState, TransportState};
pub use transport::{
    EngineEvent, PeerTransport, TransportContext, TransportEvent, TransportFactory,
    TransportSubscription,
};
pub use types::{
    IceCandidate, Occupant, PeerId, Role, Room, SdpKind, ServerConfig, SessionDescription,
    SignalPayload,
};
