use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tandem_client::mock::{MockMediaEngine, MockOp};
use tandem_client::{
    IceCandidate, MediaEngine, NegotiationEngine, NegotiationError, PeerId, Phase, RemoteTrack,
    Role, SdpType, SessionDescription, SessionEvent, SignalingSocket, SignalingState,
    SocketEvent, TrackKind,
};
use tandem_proto::{ClientFrame, ClientMessage, ServerFrame, ServerMessage};
use tokio::sync::mpsc;

struct Side {
    media: Arc<MockMediaEngine>,
    engine: NegotiationEngine,
    events: mpsc::UnboundedReceiver<SessionEvent>,
}

fn greet(peer: PeerId, polite: bool) -> ServerFrame {
    ServerMessage::Greet {
        remote_peer_id: peer,
        polite,
    }
    .into()
}

/// Greets `remote` on `socket` and starts an engine for it.
fn attach(
    label: &str,
    socket: &SignalingSocket,
    socket_events: &mut mpsc::UnboundedReceiver<SocketEvent>,
    remote: PeerId,
    polite: bool,
) -> Side {
    socket.dispatch(greet(remote, polite));
    let intro = match socket_events.try_recv() {
        Ok(SocketEvent::Greeted(intro)) => intro,
        other => panic!("expected greet, got {other:?}"),
    };
    let (media_tx, media_rx) = mpsc::unbounded_channel();
    let media = Arc::new(MockMediaEngine::new(label, media_tx));
    let (events_tx, events) = mpsc::unbounded_channel();
    let engine = NegotiationEngine::spawn(
        Role::from_polite(intro.polite),
        media.clone(),
        intro.channel,
        intro.signals,
        media_rx,
        events_tx,
    );
    Side {
        media,
        engine,
        events,
    }
}

/// Forwards what one side sends to the other, stamped with the sender's id.
async fn relay(
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    origin: PeerId,
    to: SignalingSocket,
) {
    while let Some(frame) = outbound.recv().await {
        if let ClientFrame::Message(message) = frame {
            if let Some((kind, _target, data)) = message.into_relay() {
                to.dispatch(ServerMessage::relayed(kind, origin, data).into());
            }
        }
    }
}

/// Peer 0 (impolite) and peer 1 (polite), wired back to back.
fn pair() -> (Side, Side) {
    let (a_id, b_id) = (PeerId::new(0), PeerId::new(1));
    let (out_a, out_a_rx) = mpsc::unbounded_channel();
    let (out_b, out_b_rx) = mpsc::unbounded_channel();
    let (socket_a, mut events_a) = SignalingSocket::detached(out_a);
    let (socket_b, mut events_b) = SignalingSocket::detached(out_b);
    tokio::spawn(relay(out_a_rx, a_id, socket_b.clone()));
    tokio::spawn(relay(out_b_rx, b_id, socket_a.clone()));

    let a = attach("a", &socket_a, &mut events_a, b_id, false);
    let b = attach("b", &socket_b, &mut events_b, a_id, true);
    (a, b)
}

struct Solo {
    socket: SignalingSocket,
    outbound: mpsc::UnboundedReceiver<ClientFrame>,
    side: Side,
}

const REMOTE: PeerId = PeerId::new(1);

/// One engine whose remote end is played by the test.
fn solo(polite: bool) -> Solo {
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let (socket, mut socket_events) = SignalingSocket::detached(outbound_tx);
    let side = attach("solo", &socket, &mut socket_events, REMOTE, polite);
    Solo {
        socket,
        outbound,
        side,
    }
}

impl Solo {
    fn remote_description(&self, description: SessionDescription) {
        self.socket.dispatch(
            ServerMessage::SessionDescription {
                remote_peer_id: REMOTE,
                data: description.to_value().unwrap(),
            }
            .into(),
        );
    }

    fn remote_candidate(&self, candidate: Option<IceCandidate>) {
        self.socket.dispatch(
            ServerMessage::IceCandidate {
                remote_peer_id: REMOTE,
                data: candidate.map(|c| c.to_value().unwrap()),
            }
            .into(),
        );
    }

    async fn sent(&mut self) -> ClientMessage {
        let frame = tokio::time::timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("engine sent nothing")
            .expect("outbound closed");
        match frame {
            ClientFrame::Message(message) => message,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    async fn sent_description(&mut self) -> SessionDescription {
        match self.sent().await {
            ClientMessage::SessionDescription {
                remote_peer_id,
                data,
            } => {
                assert_eq!(remote_peer_id, REMOTE);
                SessionDescription::from_value(data).unwrap()
            }
            other => panic!("expected description, got {other:?}"),
        }
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test_timeout::tokio_timeout_test]
async fn single_offer_reaches_stable() {
    let (a, b) = pair();
    b.media.trigger_negotiation_needed();

    wait_for("answer applied", || {
        b.media.remote_description().is_some() && b.media.signaling_state().is_stable()
    })
    .await;
    assert!(a.media.signaling_state().is_stable());
    assert_eq!(a.media.answers_created(), 1);
    assert_eq!(b.media.offers_created(), 1);
    assert_eq!(
        a.media.remote_description().map(|d| d.sdp),
        Some("b-offer-1".to_string())
    );
    assert_eq!(a.engine.phase(), Phase::Idle);
    assert_eq!(b.engine.phase(), Phase::Idle);
}

#[test_timeout::tokio_timeout_test]
async fn simultaneous_offers_resolve_in_favor_of_impolite_side() {
    for _ in 0..5 {
        let (mut a, mut b) = pair();
        assert_eq!(a.engine.role(), Role::Impolite);
        assert_eq!(b.engine.role(), Role::Polite);
        a.media.hold_offers();
        b.media.hold_offers();
        a.media.trigger_negotiation_needed();
        b.media.trigger_negotiation_needed();
        settle().await;
        assert!(a.engine.phase().making_offer());
        assert!(b.engine.phase().making_offer());

        a.media.release_offer();
        b.media.release_offer();

        wait_for("both sides stable", || {
            a.media.signaling_state().is_stable()
                && b.media.signaling_state().is_stable()
                && a.media.remote_description().is_some()
        })
        .await;

        // The polite side rolled its offer back and answered.
        assert_eq!(
            b.media.remote_description().map(|d| d.sdp),
            Some("a-offer-1".to_string())
        );
        let ops = b.media.ops();
        let rollback = ops
            .iter()
            .position(|op| *op == MockOp::Rollback)
            .expect("polite side rolls back");
        assert_eq!(
            &ops[rollback + 1..rollback + 3],
            &[
                MockOp::SetRemote(SdpType::Offer),
                MockOp::SetLocal(SdpType::Answer)
            ]
        );

        // The impolite side kept its offer and never answered.
        assert!(!a.media.ops().contains(&MockOp::Rollback));
        assert_eq!(a.media.answers_created(), 0);
        assert_eq!(
            a.media.remote_description().map(|d| d.kind),
            Some(SdpType::Answer)
        );

        settle().await;
        assert!(a.events.try_recv().is_err());
        assert!(b.events.try_recv().is_err());
    }
}

#[test_timeout::tokio_timeout_test]
async fn impolite_side_drops_candidates_of_ignored_offer() {
    let mut solo = solo(false);
    solo.side.media.trigger_negotiation_needed();
    let offer = solo.sent_description().await;
    assert!(offer.is_offer());
    assert_eq!(
        solo.side.media.signaling_state(),
        SignalingState::HaveLocalOffer
    );

    solo.remote_description(SessionDescription::offer("remote-offer"));
    solo.remote_candidate(Some(IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host")));
    settle().await;

    assert!(solo.side.engine.phase().ignore_offer());
    assert_eq!(solo.side.media.remote_description(), None);
    assert_eq!(solo.side.media.answers_created(), 0);
    assert!(solo.side.events.try_recv().is_err());
    assert!(solo.outbound.try_recv().is_err());

    solo.remote_description(SessionDescription::answer("remote-answer"));
    wait_for("answer applied", || {
        solo.side.media.signaling_state().is_stable()
    })
    .await;
    assert_eq!(solo.side.engine.phase(), Phase::Idle);
}

#[test_timeout::tokio_timeout_test]
async fn polite_side_answers_and_reports_rejected_candidates() {
    let mut solo = solo(true);
    solo.remote_description(SessionDescription::offer("remote-offer"));
    let answer = solo.sent_description().await;
    assert_eq!(answer.kind, SdpType::Answer);
    assert!(solo.side.media.signaling_state().is_stable());

    solo.side.media.reject_candidates(true);
    solo.remote_candidate(Some(IceCandidate::new("candidate:bad")));
    let event = tokio::time::timeout(Duration::from_secs(5), solo.side.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        event,
        SessionEvent::NegotiationFailed {
            peer,
            error: NegotiationError::AddIceCandidate(_)
        } if peer == REMOTE
    ));

    // The connection keeps working after the failure.
    solo.side.media.reject_candidates(false);
    solo.remote_candidate(None);
    wait_for("end of candidates", || {
        solo.side.media.applied_candidates() == vec![None]
    })
    .await;
}

#[test_timeout::tokio_timeout_test]
async fn offer_is_abandoned_when_negotiation_is_already_underway() {
    let mut solo = solo(false);
    solo.side.media.hold_offers();
    solo.side.media.trigger_negotiation_needed();
    settle().await;
    solo.side.media.trigger_negotiation_needed();
    settle().await;

    solo.side.media.release_offer();
    let offer = solo.sent_description().await;
    assert_eq!(offer.sdp, "solo-offer-1");
    settle().await;

    assert_eq!(solo.side.media.offers_created(), 1);
    assert!(solo.outbound.try_recv().is_err());
    assert_eq!(solo.side.engine.phase(), Phase::Idle);
    assert!(solo.side.events.try_recv().is_err());
}

#[test_timeout::tokio_timeout_test]
async fn local_candidates_and_tracks_are_forwarded() {
    let mut solo = solo(true);
    let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");
    candidate.sdp_mid = Some("0".into());
    candidate.sdp_mline_index = Some(0);
    solo.side.media.emit_local_candidate(Some(candidate.clone()));
    solo.side.media.emit_local_candidate(None);

    match solo.sent().await {
        ClientMessage::IceCandidate {
            remote_peer_id,
            data: Some(data),
        } => {
            assert_eq!(remote_peer_id, REMOTE);
            assert_eq!(IceCandidate::from_value(data).unwrap(), candidate);
        }
        other => panic!("expected candidate, got {other:?}"),
    }
    assert_eq!(
        solo.sent().await,
        ClientMessage::IceCandidate {
            remote_peer_id: REMOTE,
            data: None
        }
    );

    let track = RemoteTrack {
        track_id: "remote-mic".into(),
        stream_id: "remote".into(),
        kind: TrackKind::Audio,
    };
    solo.side.media.emit_remote_track(track.clone());
    match solo.side.events.recv().await {
        Some(SessionEvent::RemoteTrack { peer, track: got }) => {
            assert_eq!(peer, REMOTE);
            assert_eq!(got, track);
        }
        other => panic!("expected remote track, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test]
async fn undecodable_payload_is_reported_not_fatal() {
    let mut solo = solo(true);
    solo.socket.dispatch(
        ServerMessage::SessionDescription {
            remote_peer_id: REMOTE,
            data: json!({"type": "bogus"}),
        }
        .into(),
    );
    let event = solo.side.events.recv().await.unwrap();
    assert!(matches!(
        event,
        SessionEvent::NegotiationFailed {
            error: NegotiationError::Payload(_),
            ..
        }
    ));

    solo.remote_description(SessionDescription::offer("remote-offer"));
    assert_eq!(solo.sent_description().await.kind, SdpType::Answer);
}

#[test_timeout::tokio_timeout_test]
async fn close_mid_negotiation_is_quiet() {
    let mut solo = solo(false);
    solo.side.media.hold_offers();
    solo.side.media.trigger_negotiation_needed();
    settle().await;
    assert!(solo.side.engine.phase().making_offer());

    solo.side.engine.close().await;
    solo.side.engine.close().await;
    settle().await;
    solo.side.media.release_offer();
    settle().await;

    assert!(solo.side.media.is_closed());
    assert_eq!(solo.side.engine.phase(), Phase::Idle);
    assert!(solo.outbound.try_recv().is_err());
    assert!(solo.side.events.try_recv().is_err());
}
