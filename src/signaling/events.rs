use super::HubEvent;
use crate::error::SignalingError;
use crate::peer::types::{IceCandidate, Occupant, PeerId, Room, SdpKind, SessionDescription};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// Методы хаба, которые слушает движок
pub const INBOUND_TARGETS: [&str; 6] = [
    "JoinedRoom",
    "LeavedRoom",
    "RejoinedRoom",
    "ReceiveOffer",
    "ReceiveAnswer",
    "ReceiveCandidate",
];

/// Входящее событие сигнального канала, уже разобранное
#[derive(Debug, Clone, PartialEq)]
pub enum InboundSignal {
    JoinedRoom {
        occupant: Occupant,
        room: Room,
        should_initiate: bool,
    },
    LeavedRoom {
        occupant: Occupant,
        room: Option<Room>,
    },
    RejoinedRoom {
        occupant: Occupant,
        room: Room,
    },
    Offer {
        from: PeerId,
        offer: SessionDescription,
    },
    Answer {
        from: PeerId,
        answer: SessionDescription,
    },
    Candidate {
        from: PeerId,
        candidate: IceCandidate,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipArgs {
    #[serde(alias = "currentUser", alias = "user")]
    occupant: Occupant,
    #[serde(default)]
    room: Option<Room>,
    #[serde(default, alias = "createOffer")]
    should_initiate: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferArgs {
    offer: SessionDescription,
    #[serde(alias = "fromUserId")]
    from_peer_id: PeerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnswerArgs {
    answer: SessionDescription,
    #[serde(alias = "fromUserId")]
    from_peer_id: PeerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateArgs {
    #[serde(default)]
    candidate: Option<IceCandidate>,
    #[serde(alias = "fromUserId")]
    from_peer_id: PeerId,
}

fn arg<T: DeserializeOwned>(args: &[Value], index: usize, name: &str) -> Result<T, SignalingError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| SignalingError::Protocol(format!("missing argument '{name}'")))?;
    Ok(serde_json::from_value(value)?)
}

/// Один аргумент-объект или позиционные аргументы
fn membership(args: &[Value]) -> Result<MembershipArgs, SignalingError> {
    if args.len() == 1 {
        return Ok(serde_json::from_value(args[0].clone())?);
    }
    Ok(MembershipArgs {
        occupant: arg(args, 0, "occupant")?,
        room: Some(arg(args, 1, "room")?),
        should_initiate: match args.get(2) {
            Some(v) => serde_json::from_value(v.clone())?,
            None => false,
        },
    })
}

fn expect_kind(desc: SessionDescription, kind: SdpKind) -> Result<SessionDescription, SignalingError> {
    if desc.kind != kind {
        return Err(SignalingError::Protocol(format!(
            "expected {kind:?} description, got {:?}",
            desc.kind
        )));
    }
    Ok(desc)
}

impl InboundSignal {
    /// Разбирает вызов хаба. `Ok(None)` — событие корректно, но не требует действий
    /// (например, пустой кандидат, означающий конец сбора).
    pub fn parse(event: &HubEvent) -> Result<Option<Self>, SignalingError> {
        let args = event.args.as_slice();
        let target = event.target.as_str();

        let signal = if target.eq_ignore_ascii_case("JoinedRoom") {
            let m = membership(args)?;
            let room = m
                .room
                .ok_or_else(|| SignalingError::Protocol("JoinedRoom without room".into()))?;
            InboundSignal::JoinedRoom {
                occupant: m.occupant,
                room,
                should_initiate: m.should_initiate,
            }
        } else if target.eq_ignore_ascii_case("LeavedRoom") {
            let m = membership(args)?;
            InboundSignal::LeavedRoom {
                occupant: m.occupant,
                room: m.room,
            }
        } else if target.eq_ignore_ascii_case("RejoinedRoom") {
            let m = membership(args)?;
            let room = m
                .room
                .ok_or_else(|| SignalingError::Protocol("RejoinedRoom without room".into()))?;
            InboundSignal::RejoinedRoom {
                occupant: m.occupant,
                room,
            }
        } else if target.eq_ignore_ascii_case("ReceiveOffer") {
            let (offer, from) = if args.len() == 1 {
                let a: OfferArgs = arg(args, 0, "offer")?;
                (a.offer, a.from_peer_id)
            } else {
                (arg(args, 0, "offer")?, arg(args, 1, "fromPeerId")?)
            };
            InboundSignal::Offer {
                from,
                offer: expect_kind(offer, SdpKind::Offer)?,
            }
        } else if target.eq_ignore_ascii_case("ReceiveAnswer") {
            let (answer, from) = if args.len() == 1 {
                let a: AnswerArgs = arg(args, 0, "answer")?;
                (a.answer, a.from_peer_id)
            } else {
                (arg(args, 0, "answer")?, arg(args, 1, "fromPeerId")?)
            };
            InboundSignal::Answer {
                from,
                answer: expect_kind(answer, SdpKind::Answer)?,
            }
        } else if target.eq_ignore_ascii_case("ReceiveCandidate") {
            let (candidate, from) = if args.len() == 1 {
                let a: CandidateArgs = arg(args, 0, "candidate")?;
                (a.candidate, a.from_peer_id)
            } else {
                (arg(args, 0, "candidate")?, arg(args, 1, "fromPeerId")?)
            };
            match candidate {
                Some(candidate) if !candidate.candidate.is_empty() => {
                    InboundSignal::Candidate { from, candidate }
                }
                _ => {
                    log::debug!("End-of-candidates from {from}");
                    return Ok(None);
                }
            }
        } else {
            return Err(SignalingError::Protocol(format!("unknown event '{target}'")));
        };
        Ok(Some(signal))
    }
}
