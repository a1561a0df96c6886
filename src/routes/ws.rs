//! WebSocket handler — envelope dispatch over one socket per tab.
//!
//! DESIGN
//! ======
//! On upgrade, generates a connection id, registers with the connection
//! registry, and enters a `select!` loop:
//! - Incoming client text → parse `{type, payload}` → dispatch by tag
//! - Messages queued by room peers → forward to the client
//!
//! Dispatch handlers return the replies owed to the sender; all peer fan-out
//! happens inside the services. Replies travel on the socket directly, peer
//! traffic through the bounded per-connection queue.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → register connection
//! 2. Client sends envelopes → dispatch → service call → replies
//! 3. Close → leave current room (may broadcast `player_left`) → unregister

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{
    CellUpdatePayload, CursorMovePayload, Envelope, JoinRoomPayload, ReactionPayload,
    RequestHintPayload, SendMessagePayload, ServerMessage,
};
use crate::model::{GameMode, RoomStatus};
use crate::registry::Connection;
use crate::services::game::{self, GameError};
use crate::services::room;
use crate::state::AppState;

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = params.get("userId").and_then(|s| s.parse().ok()) else {
        return (StatusCode::BAD_REQUEST, "userId query parameter required").into_response();
    };
    let display_name = params
        .get("displayName")
        .cloned()
        .unwrap_or_else(|| "Anonymous".to_owned());

    ws.on_upgrade(move |socket| run_ws(socket, state, user_id, display_name))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, user_id: Uuid, display_name: String) {
    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(state.config.queue_capacity);
    let conn = Connection { conn_id, user_id, display_name, tx };
    state.registry.register(conn.clone()).await;
    info!(%conn_id, %user_id, "ws: client connected");

    // The room this connection has joined, if any.
    let mut current_room: Option<Uuid> = None;

    loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(msg)) = inbound else { break };
                match msg {
                    Message::Text(text) => {
                        let replies =
                            process_inbound_text(&state, &conn, &mut current_room, &text).await;
                        let mut closed = false;
                        for reply in replies {
                            if send_message(&mut socket, &reply).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(text) = rx.recv() => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    // Leave before unregistering so `player_left` still reaches the room.
    if let Some(room_id) = current_room {
        room::leave_room(&state, room_id, conn_id).await;
    }
    state.registry.unregister(conn_id).await;
    info!(%conn_id, "ws: client disconnected");
}

async fn send_message(socket: &mut WebSocket, msg: &ServerMessage) -> Result<(), ()> {
    let Some(text) = room::encode(msg) else {
        return Ok(());
    };
    socket.send(Message::Text(text)).await.map_err(|_| ())
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Parse one inbound text frame and return the replies owed to the sender.
///
/// Split from the socket loop so tests can drive the full dispatch path
/// without a live websocket.
async fn process_inbound_text(
    state: &AppState,
    conn: &Connection,
    current_room: &mut Option<Uuid>,
    text: &str,
) -> Vec<ServerMessage> {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            warn!(conn_id = %conn.conn_id, error = %e, "ws: invalid inbound frame");
            return vec![ServerMessage::error(format!("invalid json: {e}"))];
        }
    };
    if envelope.kind != "cursor_move" {
        info!(conn_id = %conn.conn_id, kind = %envelope.kind, "ws: recv");
    }
    dispatch(state, conn, current_room, envelope).await
}

fn parse_payload<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, ServerMessage> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        ServerMessage::error(format!("invalid {} payload: {e}", envelope.kind))
    })
}

fn game_error_reply(err: &GameError) -> ServerMessage {
    match err {
        GameError::Store(e) => {
            warn!(error = %e, "game service store failure");
            ServerMessage::error("internal error")
        }
        other => ServerMessage::error(other.to_string()),
    }
}

async fn dispatch(
    state: &AppState,
    conn: &Connection,
    current_room: &mut Option<Uuid>,
    envelope: Envelope,
) -> Vec<ServerMessage> {
    match envelope.kind.as_str() {
        "join_room" => {
            let payload: JoinRoomPayload = match parse_payload(&envelope) {
                Ok(p) => p,
                Err(reply) => return vec![reply],
            };
            // One room per connection: joining parts the previous one.
            if let Some(old_room) = current_room.take() {
                room::leave_room(state, old_room, conn.conn_id).await;
            }
            match room::join_room(
                state,
                conn,
                &payload.room_code,
                &payload.display_name,
                payload.is_spectator,
            )
            .await
            {
                Ok(snapshot) => {
                    if let ServerMessage::RoomState { room, .. } = &snapshot {
                        *current_room = Some(room.id);
                        ensure_relay_timer(state, room.id, room.mode, room.status).await;
                    }
                    vec![snapshot]
                }
                Err(e) => vec![ServerMessage::error(e.to_string())],
            }
        }
        "leave_room" => {
            if let Some(room_id) = current_room.take() {
                room::leave_room(state, room_id, conn.conn_id).await;
            }
            vec![]
        }
        "cell_update" => {
            // Updates from connections that never joined are dropped.
            let Some(room_id) = *current_room else {
                return vec![];
            };
            let payload: CellUpdatePayload = match parse_payload(&envelope) {
                Ok(p) => p,
                Err(reply) => return vec![reply],
            };
            match game::cell_update(state, conn, room_id, payload.x, payload.y, payload.value)
                .await
            {
                Ok(()) => vec![],
                Err(e) => vec![game_error_reply(&e)],
            }
        }
        "cursor_move" => {
            // Cursors before joining are silently ignored.
            let Some(room_id) = *current_room else {
                return vec![];
            };
            let Ok(payload) = parse_payload::<CursorMovePayload>(&envelope) else {
                return vec![];
            };
            room::cursor_move(
                state,
                room_id,
                conn.conn_id,
                conn.user_id,
                &conn.display_name,
                payload.x,
                payload.y,
            )
            .await;
            vec![]
        }
        "send_message" => {
            let Some(room_id) = *current_room else {
                return vec![ServerMessage::error("join a room first")];
            };
            let payload: SendMessagePayload = match parse_payload(&envelope) {
                Ok(p) => p,
                Err(reply) => return vec![reply],
            };
            room::send_chat(state, room_id, conn.user_id, &conn.display_name, &payload.text)
                .await;
            vec![]
        }
        "start_game" => {
            let Some(room_id) = *current_room else {
                return vec![ServerMessage::error("join a room first")];
            };
            match game::start_game(state, room_id, conn.user_id).await {
                Ok(()) => vec![],
                Err(e) => vec![game_error_reply(&e)],
            }
        }
        "pass_turn" => {
            let Some(room_id) = *current_room else {
                return vec![ServerMessage::error("join a room first")];
            };
            match game::pass_turn(state, room_id, conn.user_id).await {
                Ok(()) => vec![],
                Err(e) => vec![game_error_reply(&e)],
            }
        }
        "request_hint" => {
            let Some(room_id) = *current_room else {
                return vec![ServerMessage::error("join a room first")];
            };
            let payload: RequestHintPayload = match parse_payload(&envelope) {
                Ok(p) => p,
                Err(reply) => return vec![reply],
            };
            match game::request_hint(state, conn, room_id, payload.kind, payload.x, payload.y)
                .await
            {
                Ok(reply) => vec![reply],
                Err(e) => vec![game_error_reply(&e)],
            }
        }
        "reaction" => {
            let Some(room_id) = *current_room else {
                return vec![ServerMessage::error("join a room first")];
            };
            let payload: ReactionPayload = match parse_payload(&envelope) {
                Ok(p) => p,
                Err(reply) => return vec![reply],
            };
            room::reaction(state, room_id, conn.user_id, &payload.clue_id, &payload.emoji).await;
            vec![]
        }
        // Unknown tags are logged and dropped, never fatal.
        other => {
            warn!(conn_id = %conn.conn_id, kind = other, "ws: unknown message type");
            vec![]
        }
    }
}

/// Joining a relay room whose game is already running restarts the turn
/// watchdog if the session was rebuilt after an eviction.
async fn ensure_relay_timer(state: &AppState, room_id: Uuid, mode: GameMode, status: RoomStatus) {
    if mode != GameMode::Relay || status != RoomStatus::Active {
        return;
    }
    let Some(session) = state.session(room_id).await else {
        return;
    };
    let mut session = session.lock().await;
    if !session.relay_timer_running {
        session.relay_timer_running = true;
        let _ = game::spawn_relay_timer(state.clone(), room_id);
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
