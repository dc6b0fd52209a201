mod common;

use common::{candidate, candidate_for, sdp_with_ufrag, Harness};
use roomcall::config::NegotiationMode;
use roomcall::signaling::{HubEvent, InboundSignal};
use roomcall::{
    CallConfig, CallEvent, Occupant, PeerId, Role, SessionDescription, SessionState, TransportState,
};
use serde_json::json;

fn peer(id: u64) -> PeerId {
    PeerId::from(id)
}

#[tokio::test]
async fn initiator_sends_offer_to_new_occupant() {
    let mut h = Harness::new(CallConfig::default());

    assert_eq!(h.join(1, &[1, 2], true).await, 1);

    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::OfferSent));
    assert_eq!(h.manager.session_role(&peer(2)), Some(Role::Initiator));
    assert_eq!(h.manager.session_state(&peer(1)), None);

    let offers = h.sent("SendOffer");
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].0["type"], "offer");
    assert_eq!(offers[0].1, json!(2));
    assert!(h.factory.last_for(&peer(2)).record().has_local_tracks);
}

#[tokio::test]
async fn responder_answers_incoming_offer() {
    let mut h = Harness::new(CallConfig::default());
    h.join(2, &[1, 2], false).await;
    assert_eq!(h.manager.session_state(&peer(1)), Some(SessionState::Created));
    assert!(h.sent("SendOffer").is_empty());

    h.manager
        .handle_incoming_offer(peer(1), SessionDescription::offer("v=0 from 1"))
        .await;

    assert_eq!(h.manager.session_role(&peer(1)), Some(Role::Responder));
    assert_eq!(h.manager.session_state(&peer(1)), Some(SessionState::AnswerSent));
    let answers = h.sent("SendAnswer");
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].0["type"], "answer");
    assert_eq!(answers[0].1, json!(1));
    // сессия та же, новой не создавали
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn offer_from_unknown_peer_creates_responder() {
    let mut h = Harness::new(CallConfig::default());
    h.manager
        .handle_incoming_offer(peer(8), SessionDescription::offer("v=0"))
        .await;
    assert_eq!(h.manager.session_role(&peer(8)), Some(Role::Responder));
    assert_eq!(h.manager.session_state(&peer(8)), Some(SessionState::AnswerSent));
}

#[tokio::test]
async fn candidates_before_answer_are_applied_in_order() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 2], true).await;

    for n in 1..=3 {
        h.manager.handle_incoming_candidate(peer(2), candidate(n)).await;
    }
    assert_eq!(h.manager.pending_candidates(&peer(2)), 3);
    assert!(h.factory.last_for(&peer(2)).record().applied_candidates.is_empty());

    h.manager
        .handle_incoming_answer(peer(2), SessionDescription::answer("v=0"))
        .await;

    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::AnswerReceived));
    assert_eq!(h.manager.pending_candidates(&peer(2)), 0);
    assert_eq!(
        h.factory.last_for(&peer(2)).record().applied_candidates,
        vec![candidate(1), candidate(2), candidate(3)]
    );

    // после remote description — сразу, без буфера
    h.manager.handle_incoming_candidate(peer(2), candidate(4)).await;
    assert_eq!(h.manager.pending_candidates(&peer(2)), 0);
    assert_eq!(h.factory.last_for(&peer(2)).record().applied_candidates.len(), 4);
}

#[tokio::test]
async fn candidates_racing_ahead_of_session_are_kept_and_applied_once() {
    let mut h = Harness::new(CallConfig::default());

    h.manager.handle_incoming_candidate(peer(5), candidate(1)).await;
    h.manager.handle_incoming_candidate(peer(5), candidate(2)).await;
    assert_eq!(h.manager.session_state(&peer(5)), None);
    assert_eq!(h.manager.pending_candidates(&peer(5)), 2);

    h.manager
        .handle_incoming_offer(peer(5), SessionDescription::offer("v=0"))
        .await;
    h.manager.handle_incoming_candidate(peer(5), candidate(3)).await;

    let record = h.factory.last_for(&peer(5)).record();
    assert_eq!(
        record.applied_candidates,
        vec![candidate(1), candidate(2), candidate(3)]
    );
    assert_eq!(h.manager.pending_candidates(&peer(5)), 0);
}

#[tokio::test]
async fn failing_buffered_candidate_is_skipped() {
    let mut h = Harness::new(CallConfig::default());
    h.factory.reject_candidates_containing("candidate:2 ");
    h.join(1, &[1, 2], true).await;
    for n in 1..=3 {
        h.manager.handle_incoming_candidate(peer(2), candidate(n)).await;
    }

    h.manager
        .handle_incoming_answer(peer(2), SessionDescription::answer("v=0"))
        .await;

    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::AnswerReceived));
    assert_eq!(
        h.factory.last_for(&peer(2)).record().applied_candidates,
        vec![candidate(1), candidate(3)]
    );
}

#[tokio::test]
async fn repeated_membership_keeps_one_session_per_peer() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 2, 2, 3], true).await;
    h.join(1, &[1, 2, 3], true).await;
    h.join(1, &[3, 2], false).await;

    assert_eq!(h.manager.session_count(), 2);
    assert_eq!(h.manager.peers(), vec![peer(2), peer(3)]);
    assert_eq!(h.factory.created(), 2);
    assert_eq!(h.sent("SendOffer").len(), 2);
}

#[tokio::test]
async fn duplicate_offer_is_ignored() {
    let mut h = Harness::new(CallConfig::default());
    h.manager
        .handle_incoming_offer(peer(4), SessionDescription::offer("v=0"))
        .await;
    h.manager
        .handle_incoming_offer(peer(4), SessionDescription::offer("v=0"))
        .await;

    assert_eq!(h.sent("SendAnswer").len(), 1);
    assert_eq!(h.factory.last_for(&peer(4)).record().answers_created, 1);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn offer_on_connected_session_renegotiates_in_place() {
    let mut h = Harness::new(CallConfig::default());
    h.manager
        .handle_incoming_offer(peer(4), SessionDescription::offer("v=0 first"))
        .await;
    h.transport_state(4, TransportState::Connected).await;
    let session_id = h.manager.session_id(&peer(4));

    h.manager
        .handle_incoming_offer(peer(4), SessionDescription::offer("v=0 second"))
        .await;

    assert_eq!(h.manager.session_state(&peer(4)), Some(SessionState::Connected));
    assert_eq!(h.manager.session_id(&peer(4)), session_id);
    assert_eq!(h.manager.snapshot()[0].renegotiations, 1);
    assert_eq!(h.sent("SendAnswer").len(), 2);
    assert_eq!(h.factory.last_for(&peer(4)).record().remote_descriptions.len(), 2);
}

#[tokio::test]
async fn offer_after_answer_received_goes_back_through_answer_sent() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 2], true).await;
    h.manager
        .handle_incoming_answer(peer(2), SessionDescription::answer("v=0"))
        .await;

    h.manager
        .handle_incoming_offer(peer(2), SessionDescription::offer("v=0 again"))
        .await;

    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::AnswerSent));
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn stray_answers_are_ignored() {
    let mut h = Harness::new(CallConfig::default());
    h.manager
        .handle_incoming_answer(peer(9), SessionDescription::answer("v=0"))
        .await;
    assert_eq!(h.manager.session_count(), 0);

    h.manager
        .handle_incoming_offer(peer(4), SessionDescription::offer("v=0"))
        .await;
    h.manager
        .handle_incoming_answer(peer(4), SessionDescription::answer("v=0"))
        .await;
    assert_eq!(h.manager.session_state(&peer(4)), Some(SessionState::AnswerSent));
    assert_eq!(h.factory.last_for(&peer(4)).record().remote_descriptions.len(), 1);
}

#[tokio::test]
async fn glare_smaller_id_yields() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 2], true).await;
    let offered_session = h.manager.session_id(&peer(2));

    h.manager
        .handle_incoming_offer(peer(2), SessionDescription::offer("v=0 from 2"))
        .await;

    assert_eq!(h.manager.session_role(&peer(2)), Some(Role::Responder));
    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::AnswerSent));
    assert_ne!(h.manager.session_id(&peer(2)), offered_session);
    assert_eq!(h.sent("SendAnswer").len(), 1);

    let handles = h.factory.handles_for(&peer(2));
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].record().close_calls, 1);
}

#[tokio::test]
async fn glare_larger_id_keeps_its_offer() {
    let mut h = Harness::new(CallConfig::default());
    h.join(3, &[2, 3], true).await;
    h.manager.handle_incoming_candidate(peer(2), candidate(1)).await;

    h.manager
        .handle_incoming_offer(peer(2), SessionDescription::offer("v=0 from 2"))
        .await;

    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::OfferSent));
    assert_eq!(h.manager.session_role(&peer(2)), Some(Role::Initiator));
    assert!(h.sent("SendAnswer").is_empty());
    assert_eq!(h.manager.pending_candidates(&peer(2)), 0);
    assert_eq!(h.factory.created(), 1);
}

#[tokio::test]
async fn local_candidates_are_sent_to_the_peer() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 2], true).await;

    assert!(h.factory.last_for(&peer(2)).post_local_candidate(candidate(7)));
    assert_eq!(h.manager.process_pending_events().await, 1);

    let sent = h.sent("SendCandidate");
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0["sdpMid"], "0");
    assert_eq!(sent[0].0["sdpMLineIndex"], 0);
    assert_eq!(sent[0].1, json!(2));
}

#[tokio::test]
async fn failed_offer_removes_session() {
    let mut h = Harness::new(CallConfig::default());
    h.factory.fail_offers(true);

    h.join(1, &[1, 2], true).await;

    assert_eq!(h.manager.session_count(), 0);
    assert!(h.sent("SendOffer").is_empty());
    assert_eq!(h.factory.last_for(&peer(2)).record().close_calls, 1);
    assert!(h
        .drain_events()
        .contains(&CallEvent::PeerRemoved { peer_id: peer(2) }));
}

#[tokio::test]
async fn malformed_hub_messages_are_dropped() {
    let mut h = Harness::new(CallConfig::default());
    let garbage = [
        HubEvent {
            target: "ReceiveOffer".into(),
            args: vec![json!({"offer": "nope", "fromPeerId": 2})],
        },
        HubEvent {
            target: "ReceiveAnswer".into(),
            args: vec![json!({"answer": {"type": "offer", "sdp": "x"}, "fromPeerId": 2})],
        },
        HubEvent {
            target: "JoinedRoom".into(),
            args: vec![json!(42)],
        },
        HubEvent {
            target: "ReceiveCandidate".into(),
            args: vec![],
        },
    ];
    for event in &garbage {
        h.manager.handle_hub_event(event).await;
    }
    assert_eq!(h.manager.session_count(), 0);
    assert!(h.signaling.sent().is_empty());
}

#[tokio::test]
async fn hub_events_drive_the_manager() {
    let mut h = Harness::new(CallConfig::default());
    h.manager
        .handle_hub_event(&HubEvent {
            target: "JoinedRoom".into(),
            args: vec![json!({
                "currentUser": {"id": 1, "login": "alice"},
                "room": {"id": 10, "title": "general", "users": [{"id": 1}, {"id": 2}, {"id": 3}]},
                "createOffer": true
            })],
        })
        .await;
    assert_eq!(h.manager.local_id(), Some(&peer(1)));
    assert_eq!(h.manager.session_count(), 2);

    h.manager
        .handle_hub_event(&HubEvent {
            target: "ReceiveAnswer".into(),
            args: vec![json!({"answer": {"type": "answer", "sdp": "v=0"}, "fromUserId": 3})],
        })
        .await;
    assert_eq!(h.manager.session_state(&peer(3)), Some(SessionState::AnswerReceived));

    h.manager
        .handle_hub_event(&HubEvent {
            target: "LeavedRoom".into(),
            args: vec![json!({"id": 2}), json!({"id": 10, "users": [{"id": 1}, {"id": 3}]})],
        })
        .await;
    assert_eq!(h.manager.peers(), vec![peer(3)]);
}

#[tokio::test]
async fn relay_mode_negotiates_only_with_relay() {
    let config = CallConfig {
        mode: NegotiationMode::Relay {
            relay_id: PeerId::from("sfu"),
        },
        ..Default::default()
    };
    let mut h = Harness::new(config);

    h.join(1, &[1, 2, 3], false).await;

    let relay = PeerId::from("sfu");
    assert_eq!(h.manager.peers(), vec![relay.clone()]);
    assert_eq!(h.manager.session_role(&relay), Some(Role::Initiator));
    assert_eq!(h.manager.session_state(&relay), Some(SessionState::OfferSent));
    assert_eq!(h.sent("SendOffer")[0].1, json!("sfu"));

    h.manager
        .handle_hub_event(&HubEvent {
            target: "LeavedRoom".into(),
            args: vec![json!({"id": 2}), json!({"id": 10, "users": [{"id": 1}, {"id": 3}]})],
        })
        .await;
    assert_eq!(h.manager.peers(), vec![relay]);
}

#[tokio::test]
async fn another_user_joining_keeps_local_identity() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 2], true).await;

    // позиционная форма: (вошедший, комната)
    h.manager
        .handle_hub_event(&HubEvent {
            target: "JoinedRoom".into(),
            args: vec![
                json!({"id": 3}),
                json!({"id": 10, "users": [{"id": 1}, {"id": 2}, {"id": 3}]}),
            ],
        })
        .await;

    assert_eq!(h.manager.local_id(), Some(&peer(1)));
    assert_eq!(h.manager.peers(), vec![peer(2), peer(3)]);
    assert_eq!(h.manager.session_role(&peer(3)), Some(Role::Responder));
    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::OfferSent));
    assert_eq!(h.factory.created(), 2);

    h.manager
        .dispatch(InboundSignal::LeavedRoom {
            occupant: Occupant::new(3),
            room: None,
        })
        .await;
    assert_eq!(h.manager.peers(), vec![peer(2)]);

    h.manager
        .dispatch(InboundSignal::LeavedRoom {
            occupant: Occupant::new(1),
            room: None,
        })
        .await;
    assert_eq!(h.manager.session_count(), 0);
}

#[tokio::test]
async fn joiner_missing_from_user_list_still_gets_a_session() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1], false).await;

    h.manager
        .handle_hub_event(&HubEvent {
            target: "JoinedRoom".into(),
            args: vec![json!({"id": 4}), json!({"id": 10, "users": [{"id": 1}]})],
        })
        .await;

    assert_eq!(h.manager.local_id(), Some(&peer(1)));
    assert_eq!(h.manager.peers(), vec![peer(4)]);
}

#[tokio::test]
async fn candidates_from_another_ice_generation_are_dropped() {
    let mut h = Harness::new(CallConfig::default());
    h.join(1, &[1, 3], true).await;
    h.manager.remove_session(&peer(3)).await;

    // с ufrag кандидат ждёт в буфере, отсев при применении
    h.manager
        .handle_incoming_candidate(peer(3), candidate_for(9, "old"))
        .await;
    assert_eq!(h.manager.pending_candidates(&peer(3)), 1);

    h.manager
        .handle_incoming_offer(peer(3), SessionDescription::offer(sdp_with_ufrag("new")))
        .await;
    h.manager
        .handle_incoming_candidate(peer(3), candidate_for(1, "new"))
        .await;
    h.manager
        .handle_incoming_candidate(peer(3), candidate_for(2, "old"))
        .await;

    assert_eq!(
        h.factory.last_for(&peer(3)).record().applied_candidates,
        vec![candidate_for(1, "new")]
    );
}

#[tokio::test]
async fn glare_keeper_ignores_candidates_of_the_abandoned_offer() {
    let mut h = Harness::new(CallConfig::default());
    h.join(3, &[2, 3], true).await;

    h.manager
        .handle_incoming_offer(peer(2), SessionDescription::offer(sdp_with_ufrag("abandoned")))
        .await;
    h.manager
        .handle_incoming_candidate(peer(2), candidate_for(1, "abandoned"))
        .await;
    h.manager
        .handle_incoming_candidate(peer(2), candidate_for(2, "fresh"))
        .await;
    h.manager
        .handle_incoming_answer(peer(2), SessionDescription::answer(sdp_with_ufrag("fresh")))
        .await;

    assert_eq!(h.manager.session_state(&peer(2)), Some(SessionState::AnswerReceived));
    assert_eq!(
        h.factory.last_for(&peer(2)).record().applied_candidates,
        vec![candidate_for(2, "fresh")]
    );
}
