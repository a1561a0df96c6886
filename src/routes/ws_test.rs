use std::time::Duration;

use axum::extract::ws::Utf8Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsFrame;

use super::*;
use crate::state::test_helpers::*;

fn test_conn(name: &str) -> (Connection, mpsc::Receiver<Utf8Bytes>) {
    let (tx, rx) = mpsc::channel(256);
    let conn = Connection {
        conn_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        display_name: name.into(),
        tx,
    };
    (conn, rx)
}

fn envelope(kind: &str, payload: Value) -> String {
    json!({"type": kind, "payload": payload}).to_string()
}

async fn recv_json(rx: &mut mpsc::Receiver<Utf8Bytes>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("outbound queue closed");
    serde_json::from_str(&text).expect("outbound frames are json")
}

fn drain(rx: &mut mpsc::Receiver<Utf8Bytes>) {
    while rx.try_recv().is_ok() {}
}

fn error_message(reply: &ServerMessage) -> &str {
    match reply {
        ServerMessage::Error { message } => message,
        other => panic!("expected error, got {}", other.tag()),
    }
}

#[tokio::test]
async fn invalid_json_gets_an_error_reply() {
    let (state, _puzzle_id) = test_app_state();
    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;

    let replies = process_inbound_text(&state, &conn, &mut current_room, "not json").await;
    assert_eq!(replies.len(), 1);
    assert!(error_message(&replies[0]).starts_with("invalid json"));
}

#[tokio::test]
async fn unknown_message_type_is_dropped() {
    let (state, _puzzle_id) = test_app_state();
    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;

    let replies =
        process_inbound_text(&state, &conn, &mut current_room, &envelope("teleport", json!({})))
            .await;
    assert!(replies.is_empty(), "unknown tags produce no reply");
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let (state, _puzzle_id) = test_app_state();
    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;

    let replies = process_inbound_text(
        &state,
        &conn,
        &mut current_room,
        &envelope("join_room", json!({"roomCode": 17})),
    )
    .await;
    assert_eq!(replies.len(), 1);
    assert!(error_message(&replies[0]).starts_with("invalid join_room payload"));
    assert!(current_room.is_none());
}

#[tokio::test]
async fn join_tracks_the_room_and_notifies_peers() {
    let (state, puzzle_id) = test_app_state();
    let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;

    let (ada, mut rx_ada) = test_conn("Ada");
    let mut ada_room = None;
    let replies = process_inbound_text(
        &state,
        &ada,
        &mut ada_room,
        &envelope("join_room", json!({"roomCode": room.code, "displayName": "Ada"})),
    )
    .await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].tag(), "room_state");
    assert_eq!(ada_room, Some(room.id));

    let (grace, _rx_grace) = test_conn("Grace");
    let mut grace_room = None;
    process_inbound_text(
        &state,
        &grace,
        &mut grace_room,
        &envelope("join_room", json!({"roomCode": room.code, "displayName": "Grace"})),
    )
    .await;

    let frame = recv_json(&mut rx_ada).await;
    assert_eq!(frame["type"], "player_joined");
}

#[tokio::test]
async fn join_with_unknown_code_replies_with_an_error() {
    let (state, _puzzle_id) = test_app_state();
    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;

    let replies = process_inbound_text(
        &state,
        &conn,
        &mut current_room,
        &envelope("join_room", json!({"roomCode": "ZZZZZZ", "displayName": "Ada"})),
    )
    .await;
    assert_eq!(error_message(&replies[0]), "room not found");
    assert!(current_room.is_none());
}

#[tokio::test]
async fn joining_a_second_room_parts_the_first() {
    let (state, puzzle_id) = test_app_state();
    let first = seed_room(&state, GameMode::Collaborative, puzzle_id).await;
    let second = seed_room(&state, GameMode::Collaborative, puzzle_id).await;

    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;
    process_inbound_text(
        &state,
        &conn,
        &mut current_room,
        &envelope("join_room", json!({"roomCode": first.code, "displayName": "Ada"})),
    )
    .await;
    process_inbound_text(
        &state,
        &conn,
        &mut current_room,
        &envelope("join_room", json!({"roomCode": second.code, "displayName": "Ada"})),
    )
    .await;

    assert_eq!(current_room, Some(second.id));
    // The first session emptied and was evicted.
    assert!(state.session(first.id).await.is_none());
    assert!(state.session(second.id).await.is_some());
}

#[tokio::test]
async fn cell_update_before_join_is_dropped() {
    let (state, puzzle_id) = test_app_state();
    let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;
    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;

    let replies = process_inbound_text(
        &state,
        &conn,
        &mut current_room,
        &envelope("cell_update", json!({"x": 0, "y": 0, "value": "S"})),
    )
    .await;
    assert!(replies.is_empty());
    assert!(state.store.grid_state(room.id, None).await.unwrap().is_none());
}

#[tokio::test]
async fn cursor_before_join_is_ignored() {
    let (state, _puzzle_id) = test_app_state();
    let (conn, _rx) = test_conn("Ada");
    let mut current_room = None;

    let replies = process_inbound_text(
        &state,
        &conn,
        &mut current_room,
        &envelope("cursor_move", json!({"x": 1, "y": 2})),
    )
    .await;
    assert!(replies.is_empty());
}

#[tokio::test]
async fn room_scoped_messages_require_a_join() {
    let (state, _puzzle_id) = test_app_state();
    let (conn, _rx) = test_conn("Ada");

    for (kind, payload) in [
        ("send_message", json!({"text": "hi"})),
        ("start_game", json!({})),
        ("pass_turn", json!({})),
        ("request_hint", json!({"type": "letter", "x": 0, "y": 0})),
        ("reaction", json!({"clueId": "1-across", "emoji": "🎉"})),
    ] {
        let mut current_room = None;
        let replies =
            process_inbound_text(&state, &conn, &mut current_room, &envelope(kind, payload))
                .await;
        assert_eq!(replies.len(), 1, "{kind} should demand a room");
        assert_eq!(error_message(&replies[0]), "join a room first", "{kind}");
    }
}

#[tokio::test]
async fn full_game_flow_over_dispatch() {
    let (state, puzzle_id) = test_app_state();
    let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;

    let (mut host, _rx_host) = test_conn("Host");
    host.user_id = room.host_user_id;
    let mut host_room = None;
    process_inbound_text(
        &state,
        &host,
        &mut host_room,
        &envelope("join_room", json!({"roomCode": room.code, "displayName": "Host"})),
    )
    .await;

    let (guest, mut rx_guest) = test_conn("Guest");
    let mut guest_room = None;
    process_inbound_text(
        &state,
        &guest,
        &mut guest_room,
        &envelope("join_room", json!({"roomCode": room.code, "displayName": "Guest"})),
    )
    .await;

    let replies =
        process_inbound_text(&state, &host, &mut host_room, &envelope("start_game", json!({})))
            .await;
    assert!(replies.is_empty());
    let frame = recv_json(&mut rx_guest).await;
    assert_eq!(frame["type"], "game_started");
    drain(&mut rx_guest);

    let replies = process_inbound_text(
        &state,
        &host,
        &mut host_room,
        &envelope("cell_update", json!({"x": 0, "y": 0, "value": "S"})),
    )
    .await;
    assert!(replies.is_empty());
    let frame = recv_json(&mut rx_guest).await;
    assert_eq!(frame["type"], "cell_updated");
    assert_eq!(frame["payload"]["value"], "S");

    let replies = process_inbound_text(
        &state,
        &host,
        &mut host_room,
        &envelope("request_hint", json!({"type": "check", "x": 0, "y": 0})),
    )
    .await;
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].tag(), "hint_result");
}

#[tokio::test]
async fn start_errors_are_relayed_to_the_sender() {
    let (state, puzzle_id) = test_app_state();
    let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;

    let (guest, _rx) = test_conn("Guest");
    let mut current_room = None;
    process_inbound_text(
        &state,
        &guest,
        &mut current_room,
        &envelope("join_room", json!({"roomCode": room.code, "displayName": "Guest"})),
    )
    .await;

    let replies =
        process_inbound_text(&state, &guest, &mut current_room, &envelope("start_game", json!({})))
            .await;
    assert_eq!(error_message(&replies[0]), "only the host can start the game");
}

// -----------------------------------------------------------------------------
// LIVE SOCKET
// -----------------------------------------------------------------------------

async fn spawn_server(state: AppState) -> std::net::SocketAddr {
    let app = crate::routes::router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    addr
}

#[tokio::test]
async fn upgrade_requires_a_user_id() {
    let (state, _puzzle_id) = test_app_state();
    let addr = spawn_server(state).await;

    let result = connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err(), "upgrade without userId must be refused");
}

#[tokio::test]
async fn join_round_trips_over_a_real_socket() {
    let (state, puzzle_id) = test_app_state();
    let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;
    let addr = spawn_server(state.clone()).await;

    let url = format!("ws://{addr}/ws?userId={}&displayName=Ada", Uuid::new_v4());
    let (mut socket, _response) = connect_async(url).await.expect("ws connect");
    for _ in 0..50 {
        if state.registry.connection_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.registry.connection_count().await, 1);

    socket
        .send(WsFrame::text(envelope(
            "join_room",
            json!({"roomCode": room.code, "displayName": "Ada"}),
        )))
        .await
        .expect("send join");

    let frame = tokio::time::timeout(Duration::from_secs(2), socket.next())
        .await
        .expect("timed out waiting for room_state")
        .expect("socket closed")
        .expect("ws error");
    let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value["type"], "room_state");
    assert_eq!(value["payload"]["room"]["code"], room.code);

    // Closing the socket unwinds room membership and the registry entry.
    socket.close(None).await.expect("close");
    for _ in 0..50 {
        if state.registry.connection_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.registry.connection_count().await, 0);
    assert!(state.session(room.id).await.is_none());
}
