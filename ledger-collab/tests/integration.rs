//! Integration tests for end-to-end room sync.
//!
//! These tests start a real server and connect real clients,
//! verifying the full request → sequencer → broadcast pipeline.

use ledger_collab::client::{ConnectionState, SyncClient, SyncEvent};
use ledger_collab::config::ServerConfig;
use ledger_collab::error::ErrorCode;
use ledger_collab::protocol::ServerEvent;
use ledger_collab::server::SyncServer;
use ledger_core::{Action, ActionDescriptor, Direction, GameState, Money};
use serde_json::json;
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> u16 {
    let port = free_port().await;
    let server = SyncServer::new(ServerConfig::new(format!("127.0.0.1:{port}")));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Connect a client and consume its `Connected` event.
async fn connect(port: u16) -> (SyncClient, Receiver<SyncEvent>) {
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Connected)) => {}
        other => panic!("expected Connected, got {other:?}"),
    }
    (client, events)
}

/// Wait for the first server event matching `pred`, skipping others.
async fn expect_event<F>(events: &mut Receiver<SyncEvent>, mut pred: F) -> ServerEvent
where
    F: FnMut(&ServerEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match timeout(remaining, events.recv()).await {
            Ok(Some(SyncEvent::Event { event, .. })) if pred(&event) => return event,
            Ok(Some(_)) => continue,
            Ok(None) => panic!("event channel closed"),
            Err(_) => panic!("timed out waiting for event"),
        }
    }
}

/// Drain whatever is already queued.
async fn drain(events: &mut Receiver<SyncEvent>) {
    while let Ok(Some(_)) = timeout(Duration::from_millis(100), events.recv()).await {}
}

async fn create_room(client: &SyncClient, events: &mut Receiver<SyncEvent>) -> String {
    client.create_room().await.unwrap();
    match expect_event(events, |e| matches!(e, ServerEvent::RoomCreated { .. })).await {
        ServerEvent::RoomCreated { room } => room,
        _ => unreachable!(),
    }
}

async fn latest_state(events: &mut Receiver<SyncEvent>) -> GameState {
    match expect_event(events, |e| matches!(e, ServerEvent::StateUpdated { .. })).await {
        ServerEvent::StateUpdated { state, .. } => state,
        _ => unreachable!(),
    }
}

fn credit_one(player: u32) -> Action {
    Action::AdjustMoney {
        player,
        direction: Direction::Credit,
        amounts: Money::from_counts([("1", 1)]),
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_test_server().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to server");
}

#[tokio::test]
async fn test_client_connects() {
    let port = start_test_server().await;
    let (client, _events) = connect(port).await;
    assert_eq!(client.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_ping_pong() {
    let port = start_test_server().await;
    let (client, mut events) = connect(port).await;

    client.send_ping().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Pong)) => {}
        other => panic!("expected Pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_create_and_join_room() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    assert_eq!(room.len(), 6);

    alice.join(&room, "Alice").await.unwrap();
    match expect_event(&mut alice_events, |e| matches!(e, ServerEvent::ParticipantJoined { .. })).await {
        ServerEvent::ParticipantJoined {
            participant,
            reconnected,
            participants,
        } => {
            assert_eq!(participant.name, "Alice");
            assert_eq!(participant.player_id, Some(1));
            assert!(!reconnected);
            assert_eq!(participants.len(), 1);
        }
        _ => unreachable!(),
    }
    let state = latest_state(&mut alice_events).await;
    assert_eq!(state.player(1).unwrap().money, Money::starting_purse());

    // A second client sees the join broadcast.
    let (bob, mut bob_events) = connect(port).await;
    bob.join(&room, "Bob").await.unwrap();
    match expect_event(&mut alice_events, |e| matches!(e, ServerEvent::ParticipantJoined { .. })).await {
        ServerEvent::ParticipantJoined { participant, .. } => {
            assert_eq!(participant.name, "Bob");
            assert_eq!(participant.player_id, Some(2));
        }
        _ => unreachable!(),
    }
    let state = latest_state(&mut bob_events).await;
    assert_eq!(state.player_count(), 2);
}

#[tokio::test]
async fn test_heartbeat_broadcasts_presence() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();
    let (bob, mut bob_events) = connect(port).await;
    bob.join(&room, "Bob").await.unwrap();
    drain(&mut alice_events).await;
    drain(&mut bob_events).await;

    alice.heartbeat(&room).await.unwrap();
    match expect_event(&mut bob_events, |e| matches!(e, ServerEvent::Presence { .. })).await {
        ServerEvent::Presence { participants } => {
            assert_eq!(participants.len(), 2);
            assert!(participants.iter().all(|p| p.online));
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_ledger_scenario_undo_redo() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();

    let (bob, mut bob_events) = connect(port).await;
    bob.join(&room, "Bob").await.unwrap();
    drain(&mut alice_events).await;
    drain(&mut bob_events).await;

    alice
        .submit_action(&room, credit_one(2), Some("Bank pays Bob 1".into()))
        .await
        .unwrap();
    let state = latest_state(&mut bob_events).await;
    assert_eq!(state.player(2).unwrap().money.count("1"), 6);
    match expect_event(&mut bob_events, |e| matches!(e, ServerEvent::LogsUpdated { .. })).await {
        ServerEvent::LogsUpdated { action_log, redo_log } => {
            assert_eq!(action_log.len(), 1);
            assert_eq!(action_log[0].description, "Bank pays Bob 1");
            assert_eq!(action_log[0].actor, "Alice");
            assert!(redo_log.is_empty());
        }
        _ => unreachable!(),
    }

    bob.undo(&room).await.unwrap();
    let state = latest_state(&mut alice_events).await;
    // The first state_updated Alice sees is from her own action.
    assert_eq!(state.player(2).unwrap().money.count("1"), 6);
    let state = latest_state(&mut alice_events).await;
    assert_eq!(state.player(2).unwrap().money.count("1"), 5);

    bob.redo(&room).await.unwrap();
    let state = latest_state(&mut alice_events).await;
    assert_eq!(state.player(2).unwrap().money.count("1"), 6);
    match expect_event(&mut alice_events, |e| matches!(e, ServerEvent::LogsUpdated { .. })).await {
        ServerEvent::LogsUpdated { action_log, redo_log } => {
            assert_eq!(action_log.len(), 1);
            assert!(redo_log.is_empty());
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_submit_state_merges_players() {
    let port = start_test_server().await;
    let (alice, mut events) = connect(port).await;
    let room = create_room(&alice, &mut events).await;
    alice.join(&room, "Alice").await.unwrap();
    drain(&mut events).await;

    let partial = GameState::from_value(json!({
        "currentTurn": 3,
        "players": { "7": { "name": "Dealer", "money": {} } }
    }))
    .unwrap();
    alice.submit_state(&room, partial, None).await.unwrap();

    let state = latest_state(&mut events).await;
    assert_eq!(state.player_count(), 2);
    assert_eq!(state.player(1).unwrap().name, "Alice");
    assert_eq!(state.player(7).unwrap().name, "Dealer");
    assert_eq!(state.field("currentTurn"), Some(&json!(3)));

    alice.fetch_state(&room).await.unwrap();
    match expect_event(&mut events, |e| matches!(e, ServerEvent::RoomState(_))).await {
        ServerEvent::RoomState(snapshot) => {
            // No descriptor, no log entry.
            assert!(snapshot.action_log.is_empty());
            assert_eq!(snapshot.state.player_count(), 2);
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_approval_flow() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();
    let (bob, mut bob_events) = connect(port).await;
    bob.join(&room, "Bob").await.unwrap();
    drain(&mut alice_events).await;
    drain(&mut bob_events).await;

    let descriptor = ActionDescriptor::new("adjust_money", "Alice collects 1")
        .with_action(credit_one(1));
    alice
        .request_approval(&room, descriptor, Some("approval-1".into()))
        .await
        .unwrap();
    match expect_event(&mut bob_events, |e| matches!(e, ServerEvent::ApprovalRequested { .. })).await {
        ServerEvent::ApprovalRequested { approval } => {
            assert_eq!(approval.id, "approval-1");
            assert_eq!(approval.requester_name, "Alice");
        }
        _ => unreachable!(),
    }

    bob.vote("approval-1", true).await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, ServerEvent::ActionApproved { .. })).await;
    let state = latest_state(&mut alice_events).await;
    assert_eq!(state.player(1).unwrap().money.count("1"), 6);

    // Resolved approvals are gone.
    bob.vote("approval-1", true).await.unwrap();
    match expect_event(&mut bob_events, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownApproval),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_rejection_needs_two_votes() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();
    let (bob, _bob_events) = connect(port).await;
    bob.join(&room, "Bob").await.unwrap();
    let (carol, _carol_events) = connect(port).await;
    carol.join(&room, "Carol").await.unwrap();
    drain(&mut alice_events).await;

    alice
        .request_approval(
            &room,
            ActionDescriptor::new("transfer_property", "Alice takes Boardwalk"),
            Some("a2".into()),
        )
        .await
        .unwrap();

    bob.vote("a2", false).await.unwrap();
    match expect_event(&mut alice_events, |e| matches!(e, ServerEvent::ApprovalUpdated { .. })).await {
        ServerEvent::ApprovalUpdated { rejections, approvals, .. } => {
            assert_eq!(rejections, 1);
            assert_eq!(approvals, 0);
        }
        _ => unreachable!(),
    }

    carol.vote("a2", false).await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, ServerEvent::ActionRejected { .. })).await;
}

#[tokio::test]
async fn test_reconnect_keeps_player() {
    let port = start_test_server().await;
    let (mut alice, mut events) = connect(port).await;
    let room = create_room(&alice, &mut events).await;
    alice.join(&room, "Alice").await.unwrap();
    drain(&mut events).await;

    let (observer, mut observer_events) = connect(port).await;
    observer.join(&room, "Observer").await.unwrap();
    drain(&mut observer_events).await;

    alice.disconnect().await;
    match expect_event(&mut observer_events, |e| matches!(e, ServerEvent::ParticipantLeft { .. })).await {
        ServerEvent::ParticipantLeft { name, participants } => {
            assert_eq!(name, "Alice");
            let alice = participants.iter().find(|p| p.name == "Alice").unwrap();
            assert!(!alice.online);
        }
        _ => unreachable!(),
    }

    let (alice_again, _events) = connect(port).await;
    alice_again.join(&room, "Alice").await.unwrap();
    match expect_event(&mut observer_events, |e| matches!(e, ServerEvent::ParticipantJoined { .. })).await {
        ServerEvent::ParticipantJoined {
            participant,
            reconnected,
            participants,
        } => {
            assert!(reconnected);
            assert_eq!(participant.player_id, Some(1));
            assert_eq!(participants.len(), 2);
        }
        _ => unreachable!(),
    }
    let state = latest_state(&mut observer_events).await;
    assert_eq!(state.player_count(), 2);
}

#[tokio::test]
async fn test_trade_is_targeted() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();
    let (bob, mut bob_events) = connect(port).await;
    bob.join(&room, "Bob").await.unwrap();
    let (carol, mut carol_events) = connect(port).await;
    carol.join(&room, "Carol").await.unwrap();
    drain(&mut alice_events).await;
    drain(&mut bob_events).await;
    drain(&mut carol_events).await;

    let offer = json!({ "give": ["Park Place"], "take": 200 });
    alice.propose_trade(&room, "Bob", offer.clone()).await.unwrap();
    match expect_event(&mut bob_events, |e| matches!(e, ServerEvent::TradeProposed { .. })).await {
        ServerEvent::TradeProposed { from, trade } => {
            assert_eq!(from, "Alice");
            assert_eq!(trade, offer);
        }
        _ => unreachable!(),
    }

    bob.accept_trade(&room, "Alice", offer).await.unwrap();
    expect_event(&mut alice_events, |e| matches!(e, ServerEvent::TradeAccepted { .. })).await;

    // Carol saw neither frame.
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), carol_events.recv()).await {
        if let SyncEvent::Event { event, .. } = event {
            assert!(!matches!(
                event,
                ServerEvent::TradeProposed { .. } | ServerEvent::TradeAccepted { .. }
            ));
        }
    }

    alice.propose_trade(&room, "Nobody", json!({})).await.unwrap();
    match expect_event(&mut alice_events, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::UnknownParticipant),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_errors_reach_only_requester() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();
    drain(&mut alice_events).await;

    let (stranger, mut stranger_events) = connect(port).await;

    stranger.join("ZZZZZZ", "Ghost").await.unwrap();
    match expect_event(&mut stranger_events, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::RoomNotFound),
        _ => unreachable!(),
    }

    stranger.submit_action(&room, credit_one(1), None).await.unwrap();
    match expect_event(&mut stranger_events, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::NotJoined),
        _ => unreachable!(),
    }

    // Alice saw nothing of either failure.
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), alice_events.recv()).await {
        if let SyncEvent::Event { event, .. } = event {
            assert!(!matches!(event, ServerEvent::Error { .. }));
        }
    }
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let port = start_test_server().await;
    let (client, mut events) = connect(port).await;

    client.send_raw(vec![0xff, 0x00, 0x13]).await.unwrap();
    // The connection survives and keeps answering.
    client.send_ping().await.unwrap();
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(SyncEvent::Pong)) => {}
        other => panic!("expected Pong, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delete_room_notifies_members() {
    let port = start_test_server().await;
    let (alice, mut alice_events) = connect(port).await;
    let room = create_room(&alice, &mut alice_events).await;
    alice.join(&room, "Alice").await.unwrap();
    drain(&mut alice_events).await;

    let (admin, mut admin_events) = connect(port).await;
    admin
        .send(&ledger_collab::ClientRequest::DeleteRoom { room: room.clone() })
        .await
        .unwrap();
    expect_event(&mut admin_events, |e| matches!(e, ServerEvent::RoomDeleted { .. })).await;
    expect_event(&mut alice_events, |e| matches!(e, ServerEvent::RoomDeleted { .. })).await;

    alice.undo(&room).await.unwrap();
    match expect_event(&mut alice_events, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::RoomNotFound),
        _ => unreachable!(),
    }
}
