//! Room service — session lifecycle, chat, cursors, and broadcast fan-out.
//!
//! DESIGN
//! ======
//! A `RoomSession` is created lazily the first time any connection joins a
//! room by code and evicted when its member set empties; the persisted
//! Room/Player rows survive eviction, so a later join reconstructs the
//! session from the store.
//!
//! ERROR HANDLING
//! ==============
//! Lookups (room by code, snapshot reads) surface their errors to the actor.
//! Hot-path writes (connected flags, cursors, chat persistence) are
//! best-effort: failures are logged and the live session stays authoritative.

use axum::extract::ws::Utf8Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::ServerMessage;
use crate::model::{ChatMessage, GameMode, Player, Room, now_ms};
use crate::registry::{Connection, OutboundSender};
use crate::state::{AppState, RoomSession, SessionMember};
use crate::store::StoreError;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("room not found")]
    NotFound,
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Fixed palette cycled by join order.
const PLAYER_COLORS: [&str; 10] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#bcf60c",
    "#fabebe", "#008080",
];

#[must_use]
pub fn color_for_index(index: usize) -> &'static str {
    PLAYER_COLORS[index % PLAYER_COLORS.len()]
}

// =============================================================================
// BROADCAST
// =============================================================================

/// Serialize an outbound message once. `None` only on serializer failure,
/// which is logged and treated as a dropped message.
#[must_use]
pub fn encode(msg: &ServerMessage) -> Option<Utf8Bytes> {
    match serde_json::to_string(msg) {
        Ok(json) => Some(Utf8Bytes::from(json)),
        Err(e) => {
            warn!(error = %e, tag = msg.tag(), "failed to serialize outbound message");
            None
        }
    }
}

/// Non-blocking push to one connection's outbound queue. If the queue is
/// full the message is dropped; bounded staleness is the accepted tradeoff.
pub fn send_to_one(tx: &OutboundSender, msg: &ServerMessage) {
    if let Some(text) = encode(msg) {
        let _ = tx.try_send(text);
    }
}

/// Fan a message out to every member of an already-locked session, except
/// the excluded connection id. Exclusion is by connection, not user, so a
/// user's other tabs still receive the message.
pub fn broadcast_session(session: &RoomSession, msg: &ServerMessage, exclude: Option<Uuid>) {
    let Some(text) = encode(msg) else {
        return;
    };
    for (conn_id, member) in &session.members {
        if exclude == Some(*conn_id) {
            continue;
        }
        let _ = member.tx.try_send(text.clone());
    }
}

/// Broadcast to a room by id. No-op if the room has no live session.
pub async fn broadcast(
    state: &AppState,
    room_id: Uuid,
    msg: &ServerMessage,
    exclude: Option<Uuid>,
) {
    let Some(session) = state.session(room_id).await else {
        return;
    };
    let session = session.lock().await;
    broadcast_session(&session, msg, exclude);
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Join a room by code. Upserts the player row, adds the connection to the
/// (lazily created) session, broadcasts `player_joined` to the rest of the
/// room, and returns the full `room_state` snapshot for the requester.
///
/// # Errors
///
/// `NotFound` if the code resolves to no room; store errors from the
/// snapshot reads.
pub async fn join_room(
    state: &AppState,
    conn: &Connection,
    room_code: &str,
    display_name: &str,
    is_spectator: bool,
) -> Result<ServerMessage, RoomError> {
    let room = state
        .store
        .room_by_code(room_code)
        .await?
        .ok_or(RoomError::NotFound)?;

    let player = upsert_joining_player(state, &room, conn.user_id, display_name, is_spectator).await?;

    // Every fallible read happens before the member insert: a failed join
    // must not leave a ghost member receiving broadcasts and holding the
    // session open.
    let snapshot = room_snapshot(state, &room, conn.user_id).await?;

    let session = state.session_or_create(&room).await;
    {
        let mut session = session.lock().await;
        session.members.insert(
            conn.conn_id,
            SessionMember {
                user_id: conn.user_id,
                display_name: display_name.to_owned(),
                tx: conn.tx.clone(),
            },
        );
        broadcast_session(
            &session,
            &ServerMessage::PlayerJoined { player: player.clone() },
            Some(conn.conn_id),
        );
        info!(room_id = %room.id, conn_id = %conn.conn_id, members = session.members.len(), "connection joined room");
    }

    Ok(snapshot)
}

/// Upsert the player row for a joining user: fresh rows get a palette color
/// by join order, returning rows keep their color and contribution.
async fn upsert_joining_player(
    state: &AppState,
    room: &Room,
    user_id: Uuid,
    display_name: &str,
    is_spectator: bool,
) -> Result<Player, RoomError> {
    let existing = state.store.player(room.id, user_id).await?;
    let player = match existing {
        Some(mut player) => {
            player.display_name = display_name.to_owned();
            player.connected = true;
            player
        }
        None => {
            let count = state.store.players_in_room(room.id).await?.len();
            Player {
                user_id,
                room_id: room.id,
                display_name: display_name.to_owned(),
                color: color_for_index(count).to_owned(),
                is_spectator,
                connected: true,
                ready: false,
                contribution: 0,
                cursor: None,
            }
        }
    };
    state.store.upsert_player(&player).await?;
    Ok(player)
}

/// Full room snapshot sent only to the joining connection: room, players,
/// mode-appropriate grid, sanitized puzzle, and recent chat.
async fn room_snapshot(
    state: &AppState,
    room: &Room,
    user_id: Uuid,
) -> Result<ServerMessage, RoomError> {
    let players = state.store.players_in_room(room.id).await?;

    // Race grids are private: the snapshot carries only the requester's own.
    let grid_owner = match room.mode {
        GameMode::Race => Some(user_id),
        GameMode::Collaborative | GameMode::Relay => None,
    };
    let grid_state = state.store.grid_state(room.id, grid_owner).await?;

    let puzzle = match state.puzzles.puzzle(room.puzzle_id).await {
        Ok(p) => p.map(|p| p.sanitized()),
        Err(e) => {
            warn!(error = %e, room_id = %room.id, "puzzle lookup failed; snapshot sent without puzzle");
            None
        }
    };

    let messages = state
        .store
        .recent_messages(room.id, state.config.recent_messages)
        .await?;

    Ok(ServerMessage::RoomState {
        room: room.clone(),
        players,
        grid_state,
        puzzle,
        messages,
    })
}

/// Remove a connection from its room session. Marks the player disconnected
/// and broadcasts `player_left` only when the user's last connection in the
/// room departs; evicts the session when the member set empties.
pub async fn leave_room(state: &AppState, room_id: Uuid, conn_id: Uuid) {
    let Some(session) = state.session(room_id).await else {
        return;
    };

    let departed = {
        let mut session = session.lock().await;
        let Some(member) = session.members.remove(&conn_id) else {
            return;
        };
        let last_for_user = !session.user_has_other_connection(member.user_id, conn_id);
        if last_for_user {
            broadcast_session(
                &session,
                &ServerMessage::PlayerLeft {
                    user_id: member.user_id,
                    display_name: member.display_name.clone(),
                },
                None,
            );
        }
        info!(%room_id, %conn_id, remaining = session.members.len(), "connection left room");
        last_for_user.then_some(member.user_id)
    };

    if let Some(user_id) = departed {
        if let Err(e) = state.store.set_player_connected(room_id, user_id, false).await {
            warn!(error = %e, %room_id, %user_id, "failed to mark player disconnected");
        }
    }

    if state.remove_session_if_empty(room_id).await {
        info!(%room_id, "evicted empty room session");
    }
}

// =============================================================================
// CHAT / CURSOR / REACTION
// =============================================================================

/// Append a chat message (best-effort) and broadcast `new_message` to the
/// whole room including the sender.
pub async fn send_chat(
    state: &AppState,
    room_id: Uuid,
    user_id: Uuid,
    display_name: &str,
    text: &str,
) {
    let message = ChatMessage {
        id: Uuid::new_v4(),
        room_id,
        user_id,
        display_name: display_name.to_owned(),
        text: text.to_owned(),
        created_at: now_ms(),
    };
    if let Err(e) = state.store.append_message(&message).await {
        warn!(error = %e, %room_id, "chat persist failed; broadcasting anyway");
    }
    broadcast(
        state,
        room_id,
        &ServerMessage::NewMessage {
            id: message.id,
            user_id: message.user_id,
            display_name: message.display_name.clone(),
            text: message.text.clone(),
            created_at: message.created_at,
        },
        None,
    )
    .await;
}

/// Persist the cursor (best-effort) and broadcast `cursor_moved` to everyone
/// except the moving connection.
pub async fn cursor_move(
    state: &AppState,
    room_id: Uuid,
    conn_id: Uuid,
    user_id: Uuid,
    display_name: &str,
    x: i64,
    y: i64,
) {
    if let Err(e) = state.store.set_player_cursor(room_id, user_id, x, y).await {
        warn!(error = %e, %room_id, %user_id, "cursor persist failed");
    }

    let color = match state.store.player(room_id, user_id).await {
        Ok(Some(player)) => player.color,
        _ => color_for_index(0).to_owned(),
    };

    broadcast(
        state,
        room_id,
        &ServerMessage::CursorMoved {
            player_id: user_id,
            display_name: display_name.to_owned(),
            x,
            y,
            color,
        },
        Some(conn_id),
    )
    .await;
}

/// Broadcast a clue reaction to the whole room. Reactions are ephemeral —
/// nothing is persisted.
pub async fn reaction(state: &AppState, room_id: Uuid, user_id: Uuid, clue_id: &str, emoji: &str) {
    broadcast(
        state,
        room_id,
        &ServerMessage::ReactionAdded {
            user_id,
            clue_id: clue_id.to_owned(),
            emoji: emoji.to_owned(),
        },
        None,
    )
    .await;
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;
