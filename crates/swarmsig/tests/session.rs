//! End-to-end session tests against the in-memory tracker and transport
//!
//! The mock relay plays the tracker: tests read the announces the session
//! sends and push responses back.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use swarmsig::mock::{MockConnectionFactory, MockRelayHandle, MockRelayTransport};
use swarmsig::{
    event_channel, AttemptState, ConnectionState, ContentDescriptor, DataChannel, DescriptorFileLoader,
    InfoHash, OfferId, SessionEnd, SessionReport, SwarmConfig, SwarmError, SwarmEvent,
    RelayTransport, SwarmSession, TransportError, TransportEvent, EVENT_CHANNEL_SIZE,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);
const SINTEL: &str = "08ada5a7a6183aae1e09d831df6748d566095a10";
const SINTEL_LENGTH: u64 = 129_241_752;

type MockSession = SwarmSession<MockRelayTransport, MockConnectionFactory>;

struct Harness {
    session: MockSession,
    relay: Arc<MockRelayTransport>,
    handle: MockRelayHandle,
    factory: Arc<MockConnectionFactory>,
    events: mpsc::Receiver<SwarmEvent>,
}

fn harness(config: SwarmConfig) -> Harness {
    harness_with_relay(config, MockRelayTransport::new())
}

fn harness_with_relay(
    config: SwarmConfig,
    (relay, handle): (Arc<MockRelayTransport>, MockRelayHandle),
) -> Harness {
    let (events_tx, events_rx) = event_channel(EVENT_CHANNEL_SIZE);
    let factory = Arc::new(MockConnectionFactory::new(events_tx.clone()));
    let mut session = SwarmSession::new(config, relay.clone(), factory.clone(), (events_tx, events_rx));
    let (sink_tx, sink_rx) = mpsc::channel(256);
    session.set_event_sink(sink_tx);
    Harness {
        session,
        relay,
        handle,
        factory,
        events: sink_rx,
    }
}

fn info_hash() -> InfoHash {
    InfoHash::from_hex(SINTEL).unwrap()
}

fn descriptor() -> ContentDescriptor {
    ContentDescriptor {
        info_hash: info_hash(),
        total_length: SINTEL_LENGTH,
        name: Some("Sintel".to_string()),
    }
}

fn spawn_run(mut session: MockSession, cancel: watch::Receiver<bool>) -> JoinHandle<Result<SessionReport, SwarmError>> {
    tokio::spawn(async move { session.run_descriptor(descriptor(), cancel).await })
}

fn offer_ids(announce: &Value) -> Vec<OfferId> {
    announce["offers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| OfferId::from_binary_text(o["offer_id"].as_str().unwrap()).unwrap())
        .collect()
}

fn answer_frame(offer_id: &OfferId, sdp: &str) -> String {
    json!({
        "action": "announce",
        "info_hash": info_hash(),
        "peer_id": "-WW0100-remotepeer01",
        "offer_id": offer_id,
        "answer": {"type": "answer", "sdp": sdp},
    })
    .to_string()
}

fn stats_frame(interval: u64) -> String {
    json!({
        "action": "announce",
        "info_hash": info_hash(),
        "interval": interval,
        "complete": 2,
        "incomplete": 5,
    })
    .to_string()
}

async fn wait_for<P>(events: &mut mpsc::Receiver<SwarmEvent>, pred: P) -> SwarmEvent
where
    P: Fn(&SwarmEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_stats(event: &SwarmEvent) -> bool {
    matches!(event, SwarmEvent::SwarmStats(_))
}

#[tokio::test]
async fn test_full_connect_flow() {
    let Harness {
        session,
        mut handle,
        mut events,
        factory,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let started = handle.next_sent_json().await.expect("started announce");
    assert_eq!(started["event"], "started");
    assert_eq!(started["action"], "announce");
    assert_eq!(started["numwant"], 1);
    assert_eq!(started["uploaded"], 0);
    assert_eq!(started["downloaded"], 0);
    assert_eq!(started["left"], SINTEL_LENGTH);
    assert_eq!(started["info_hash"], Value::String(info_hash().to_binary_text()));
    assert!(started["peer_id"].as_str().unwrap().starts_with("-WW0007-"));
    assert_eq!(started["offers"][0]["offer"]["type"], "offer");
    let ids = offer_ids(&started);
    assert_eq!(ids.len(), 1);
    let offer_id = ids[0];

    handle.push(answer_frame(&offer_id, "v=0 remote answer"));

    match wait_for(&mut events, |e| matches!(e, SwarmEvent::PeerConnected { .. })).await {
        SwarmEvent::PeerConnected {
            offer_id: id,
            peer_id,
            channel,
        } => {
            assert_eq!(id, offer_id);
            assert_eq!(peer_id.as_deref(), Some("-WW0100-remotepeer01"));
            assert_eq!(channel.label(), swarmsig::DATA_CHANNEL_LABEL);
        }
        _ => unreachable!(),
    }
    match wait_for(&mut events, |e| matches!(e, SwarmEvent::ChannelOpen { .. })).await {
        SwarmEvent::ChannelOpen { offer_id: id, .. } => assert_eq!(id, offer_id),
        _ => unreachable!(),
    }

    cancel_tx.send(true).unwrap();
    let report = task.await.unwrap().unwrap();

    assert_eq!(report.end, SessionEnd::Cancelled);
    assert_eq!(report.messages, 1);
    assert_eq!(report.attempts.connected, 1);
    assert_eq!(report.info_hash, info_hash());
    assert_eq!(
        tracker.history(&offer_id).await.unwrap(),
        vec![
            AttemptState::Created,
            AttemptState::OfferSent,
            AttemptState::AnswerReceived,
            AttemptState::Connected
        ]
    );
    assert_eq!(factory.accepted().await, vec![offer_id]);

    let stopped = handle.next_sent_json().await.expect("stopped announce");
    assert_eq!(stopped["event"], "stopped");
    assert_eq!(stopped["offers"].as_array().unwrap().len(), 0);
    assert_eq!(stopped["peer_id"], started["peer_id"]);
}

#[tokio::test]
async fn test_fabricated_offer_id_is_ignored() {
    let Harness {
        session,
        mut handle,
        mut events,
        factory,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let started = handle.next_sent_json().await.unwrap();
    let offer_id = offer_ids(&started)[0];

    let fabricated = OfferId::from_bytes([0x42; 20]);
    handle.push(answer_frame(&fabricated, "v=0"));
    handle.push(stats_frame(120));
    wait_for(&mut events, is_stats).await;

    assert_eq!(tracker.state(&offer_id).await, Some(AttemptState::OfferSent));
    assert_eq!(tracker.state(&fabricated).await, None);
    assert!(factory.accepted().await.is_empty());

    cancel_tx.send(true).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.messages, 2);
    assert_eq!(report.attempts.abandoned, 1);
}

#[tokio::test]
async fn test_relay_closes_before_any_message() {
    let Harness {
        session,
        relay,
        mut handle,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let started = handle.next_sent_json().await.unwrap();
    let offer_id = offer_ids(&started)[0];
    handle.close();

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.end, SessionEnd::RelayClosed);
    assert_eq!(report.messages, 0);
    assert_eq!(report.attempts.abandoned, 1);
    assert_eq!(tracker.state(&offer_id).await, Some(AttemptState::Abandoned));
    assert!(!relay.is_connected());
    // no stopped announce on a closed connection
    assert!(handle.try_sent().is_none());
}

#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let config = SwarmConfig {
        max_messages: Some(2),
        ..Default::default()
    };
    let Harness {
        session,
        mut handle,
        mut events,
        ..
    } = harness(config);
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    handle.next_sent_json().await.unwrap();
    handle.push("{not json");
    handle.push(stats_frame(60));

    match wait_for(&mut events, is_stats).await {
        SwarmEvent::SwarmStats(stats) => {
            assert_eq!(stats.interval, Some(60));
            assert_eq!(stats.complete, Some(2));
            assert_eq!(stats.incomplete, Some(5));
        }
        _ => unreachable!(),
    }

    let report = task.await.unwrap().unwrap();
    assert_eq!(report.end, SessionEnd::MessageLimit);
    assert_eq!(report.messages, 2);

    let stopped = handle.next_sent_json().await.unwrap();
    assert_eq!(stopped["event"], "stopped");
}

#[tokio::test]
async fn test_duplicate_answers_connect_once() {
    let Harness {
        session,
        mut handle,
        mut events,
        factory,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let offer_id = offer_ids(&handle.next_sent_json().await.unwrap())[0];
    handle.push(answer_frame(&offer_id, "first"));
    handle.push(answer_frame(&offer_id, "second"));
    handle.push(stats_frame(120));

    let mut connected = 0;
    loop {
        let event = wait_for(&mut events, |_| true).await;
        match event {
            SwarmEvent::PeerConnected { .. } => connected += 1,
            SwarmEvent::SwarmStats(_) => break,
            _ => {}
        }
    }
    assert_eq!(connected, 1);
    assert_eq!(factory.accepted().await.len(), 1);
    assert_eq!(tracker.remote_description(&offer_id).await.unwrap().sdp, "first");

    cancel_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_multiple_offers_answered_out_of_order() {
    let config = SwarmConfig {
        numwant: 3,
        ..Default::default()
    };
    let Harness {
        session,
        mut handle,
        mut events,
        ..
    } = harness(config);
    let tracker = session.tracker();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let started = handle.next_sent_json().await.unwrap();
    assert_eq!(started["numwant"], 3);
    let ids = offer_ids(&started);
    assert_eq!(ids.len(), 3);
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);

    handle.push(answer_frame(&ids[2], "third"));
    handle.push(answer_frame(&ids[0], "first"));
    handle.push(stats_frame(120));
    wait_for(&mut events, is_stats).await;

    assert_eq!(tracker.state(&ids[0]).await, Some(AttemptState::Connected));
    assert_eq!(tracker.state(&ids[1]).await, Some(AttemptState::OfferSent));
    assert_eq!(tracker.state(&ids[2]).await, Some(AttemptState::Connected));

    cancel_tx.send(true).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.attempts.connected, 2);
    assert_eq!(report.attempts.abandoned, 1);
}

#[tokio::test]
async fn test_connect_refused() {
    let Harness { session, .. } = harness_with_relay(SwarmConfig::default(), MockRelayTransport::refusing());
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let result = spawn_run(session, cancel_rx).await.unwrap();
    assert!(matches!(
        result,
        Err(SwarmError::Connection(TransportError::ConnectionFailed(_)))
    ));
}

#[tokio::test]
async fn test_relay_error_fails_session() {
    let Harness {
        session,
        mut handle,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    handle.next_sent_json().await.unwrap();
    handle.fail("connection reset by peer");

    let result = task.await.unwrap();
    assert!(matches!(
        result,
        Err(SwarmError::Connection(TransportError::ReceiveFailed(_)))
    ));
    assert_eq!(tracker.summary().await.abandoned, 1);
    assert!(handle.try_sent().is_none());
}

#[tokio::test]
async fn test_missing_descriptor_is_configuration_error() {
    let Harness {
        mut session, relay, ..
    } = harness(SwarmConfig::default());
    let dir = tempfile::TempDir::new().unwrap();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let result = session
        .run(&DescriptorFileLoader::new(), &dir.path().join("missing.toml"), cancel_rx)
        .await;

    assert!(matches!(result, Err(SwarmError::Configuration(_))));
    assert_eq!(relay.connect_count(), 0);
}

#[tokio::test]
async fn test_run_from_descriptor_file() {
    let config = SwarmConfig {
        max_messages: Some(1),
        announce_stopped: false,
        ..Default::default()
    };
    let Harness {
        mut session,
        mut handle,
        ..
    } = harness(config);
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("sintel.toml");
    std::fs::write(&path, format!("info_hash = \"{}\"\nlength = 4096\n", SINTEL)).unwrap();
    handle.push(stats_frame(120));
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let report = session
        .run(&DescriptorFileLoader::new(), &path, cancel_rx)
        .await
        .unwrap();

    assert_eq!(report.end, SessionEnd::MessageLimit);
    let started = handle.next_sent_json().await.unwrap();
    assert_eq!(started["left"], 4096);
    assert!(handle.try_sent().is_none());
}

#[tokio::test]
async fn test_reannounce_after_interval() {
    let config = SwarmConfig {
        reannounce: true,
        ..Default::default()
    };
    let Harness {
        session,
        mut handle,
        ..
    } = harness(config);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let started = handle.next_sent_json().await.unwrap();
    handle.push(stats_frame(0));

    let update = handle.next_sent_json().await.expect("update announce");
    assert_eq!(update["event"], "update");
    assert_eq!(update["peer_id"], started["peer_id"]);
    assert_ne!(offer_ids(&update), offer_ids(&started));

    cancel_tx.send(true).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.attempts.total(), 2);
}

#[tokio::test]
async fn test_tracker_failure_reported() {
    let Harness {
        session,
        mut handle,
        mut events,
        ..
    } = harness(SwarmConfig::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    handle.next_sent_json().await.unwrap();
    handle.push(r#"{"failure reason":"info_hash is not allowed"}"#);

    match wait_for(&mut events, |e| matches!(e, SwarmEvent::TrackerFailure(_))).await {
        SwarmEvent::TrackerFailure(reason) => assert_eq!(reason, "info_hash is not allowed"),
        _ => unreachable!(),
    }

    cancel_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_transport_failure_fails_attempt() {
    let Harness {
        session,
        mut handle,
        mut events,
        factory,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let offer_id = offer_ids(&handle.next_sent_json().await.unwrap())[0];
    factory.emit(TransportEvent::StateChanged {
        offer_id,
        state: ConnectionState::Failed,
    });

    match wait_for(&mut events, |e| matches!(e, SwarmEvent::NegotiationFailed { .. })).await {
        SwarmEvent::NegotiationFailed { offer_id: id, .. } => assert_eq!(id, offer_id),
        _ => unreachable!(),
    }
    assert_eq!(tracker.state(&offer_id).await, Some(AttemptState::Failed));

    // a late answer cannot revive it
    handle.push(answer_frame(&offer_id, "v=0"));
    handle.push(stats_frame(120));
    wait_for(&mut events, is_stats).await;
    assert_eq!(tracker.state(&offer_id).await, Some(AttemptState::Failed));

    cancel_tx.send(true).unwrap();
    let report = task.await.unwrap().unwrap();
    assert_eq!(report.attempts.failed, 1);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let Harness {
        session, relay, ..
    } = harness(SwarmConfig::default());
    let (_cancel_tx, cancel_rx) = watch::channel(true);

    let report = spawn_run(session, cancel_rx).await.unwrap().unwrap();
    assert_eq!(report.end, SessionEnd::Cancelled);
    assert_eq!(report.attempts.total(), 0);
    assert_eq!(relay.connect_count(), 0);
}

#[tokio::test]
async fn test_session_runs_once() {
    let Harness {
        mut session,
        handle,
        ..
    } = harness(SwarmConfig::default());
    handle.close();
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let first = session.run_descriptor(descriptor(), cancel_rx.clone()).await.unwrap();
    assert_eq!(first.end, SessionEnd::RelayClosed);

    let second = session.run_descriptor(descriptor(), cancel_rx).await;
    assert!(matches!(second, Err(SwarmError::AlreadyStarted)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout() {
    let config = SwarmConfig {
        idle_timeout: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    let Harness {
        mut session,
        mut handle,
        ..
    } = harness(config);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let report = session.run_descriptor(descriptor(), cancel_rx).await.unwrap();

    assert_eq!(report.end, SessionEnd::IdleTimeout);
    assert_eq!(handle.next_sent_json().await.unwrap()["event"], "started");
    assert_eq!(handle.next_sent_json().await.unwrap()["event"], "stopped");
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_attempt_expires() {
    let config = SwarmConfig {
        attempt_timeout: Some(Duration::from_secs(10)),
        session_timeout: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    let Harness {
        mut session,
        handle: _handle,
        mut events,
        ..
    } = harness(config);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let report = session.run_descriptor(descriptor(), cancel_rx).await.unwrap();

    assert_eq!(report.end, SessionEnd::SessionTimeout);
    assert_eq!(report.attempts.failed, 1);
    assert_eq!(report.attempts.abandoned, 0);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if let SwarmEvent::NegotiationFailed { cause, .. } = event {
            assert!(cause.contains("no answer"));
            failed = true;
        }
    }
    assert!(failed);
}

#[tokio::test]
async fn test_cancel_with_undrained_event_sink() {
    let Harness {
        mut session,
        mut handle,
        ..
    } = harness(SwarmConfig::default());
    let (sink_tx, _sink_rx) = mpsc::channel(1);
    session.set_event_sink(sink_tx);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    // the started announce fills the sink; the stats events have nowhere to go
    handle.next_sent_json().await.unwrap();
    for _ in 0..3 {
        handle.push(stats_frame(120));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel_tx.send(true).unwrap();

    let report = tokio::time::timeout(WAIT, task)
        .await
        .expect("session did not observe cancel")
        .unwrap()
        .unwrap();
    assert_eq!(report.end, SessionEnd::Cancelled);
    assert!(report.messages >= 1);
    assert_eq!(handle.next_sent_json().await.unwrap()["event"], "stopped");
}

#[tokio::test]
async fn test_cancel_while_connecting() {
    let Harness {
        session,
        relay,
        handle: _handle,
        ..
    } = harness_with_relay(SwarmConfig::default(), MockRelayTransport::stalled());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel_tx.send(true).unwrap();

    let report = tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    assert_eq!(report.end, SessionEnd::Cancelled);
    assert_eq!(report.messages, 0);
    assert_eq!(report.attempts.total(), 0);
    assert_eq!(relay.connect_count(), 0);
}

#[tokio::test]
async fn test_tracker_warning_reported() {
    let Harness {
        session,
        mut handle,
        mut events,
        ..
    } = harness(SwarmConfig::default());
    let tracker = session.tracker();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    let offer_id = offer_ids(&handle.next_sent_json().await.unwrap())[0];
    handle.push(r#"{"action":"announce","warning message":"announcing too often","interval":300}"#);

    match wait_for(&mut events, |e| matches!(e, SwarmEvent::TrackerWarning(_))).await {
        SwarmEvent::TrackerWarning(message) => assert_eq!(message, "announcing too often"),
        _ => unreachable!(),
    }
    // a warning is informational; the frame's stats still arrive
    match wait_for(&mut events, is_stats).await {
        SwarmEvent::SwarmStats(stats) => assert_eq!(stats.interval, Some(300)),
        _ => unreachable!(),
    }
    assert_eq!(tracker.state(&offer_id).await, Some(AttemptState::OfferSent));

    cancel_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_bad_offer_id_keeps_frame_stats() {
    let Harness {
        session,
        mut handle,
        mut events,
        factory,
        ..
    } = harness(SwarmConfig::default());
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = spawn_run(session, cancel_rx);

    handle.next_sent_json().await.unwrap();
    handle.push(
        json!({
            "action": "announce",
            "interval": 90,
            "offer_id": "odd",
            "answer": {"type": "answer", "sdp": "v=0"},
        })
        .to_string(),
    );

    match wait_for(&mut events, is_stats).await {
        SwarmEvent::SwarmStats(stats) => assert_eq!(stats.interval, Some(90)),
        _ => unreachable!(),
    }
    assert!(factory.accepted().await.is_empty());

    cancel_tx.send(true).unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_zero_message_limit_processes_nothing() {
    let config = SwarmConfig {
        max_messages: Some(0),
        ..Default::default()
    };
    let Harness {
        session,
        mut handle,
        ..
    } = harness(config);
    handle.push(stats_frame(120));
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let report = spawn_run(session, cancel_rx).await.unwrap().unwrap();

    assert_eq!(report.end, SessionEnd::MessageLimit);
    assert_eq!(report.messages, 0);
    assert_eq!(handle.next_sent_json().await.unwrap()["event"], "started");
    assert_eq!(handle.next_sent_json().await.unwrap()["event"], "stopped");
}
