//! Room management routes.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use crate::model::{GameMode, Player, Room, RoomStatus, now_ms};
use crate::state::AppState;
use crate::store::StoreError;

/// Code alphabet without lookalikes (no I/L/O/0/1).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LENGTH: usize = 6;
const CODE_RETRIES: usize = 4;

#[must_use]
pub fn generate_code() -> String {
    let mut rng = rand::rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomBody {
    pub name: String,
    pub mode: GameMode,
    pub host_user_id: Uuid,
    pub puzzle_id: Uuid,
    #[serde(default = "default_allow_hints")]
    pub allow_hints: bool,
    /// Relay turn budget in seconds; falls back to the configured default.
    #[serde(default)]
    pub turn_time_limit: Option<i64>,
}

fn default_allow_hints() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomResponse {
    pub room: Room,
    pub players: Vec<Player>,
}

/// `POST /api/rooms` — create a lobby room with a fresh join code.
pub async fn create_room(
    State(state): State<AppState>,
    Json(body): Json<CreateRoomBody>,
) -> Result<(StatusCode, Json<Room>), StatusCode> {
    let puzzle = state
        .puzzles
        .puzzle(body.puzzle_id)
        .await
        .map_err(internal)?;
    if puzzle.is_none() {
        return Err(StatusCode::BAD_REQUEST);
    }

    // Regenerate on the rare code collision.
    for _ in 0..CODE_RETRIES {
        let room = Room {
            id: Uuid::new_v4(),
            code: generate_code(),
            name: body.name.clone(),
            mode: body.mode,
            status: RoomStatus::Lobby,
            host_user_id: body.host_user_id,
            puzzle_id: body.puzzle_id,
            allow_hints: body.allow_hints,
            turn_time_limit: body
                .turn_time_limit
                .filter(|limit| *limit > 0)
                .unwrap_or(state.config.relay_turn_seconds),
            created_at: now_ms(),
        };
        match state.store.create_room(&room).await {
            Ok(()) => return Ok((StatusCode::CREATED, Json(room))),
            Err(StoreError::DuplicateCode(code)) => {
                error!(code, "room code collision; regenerating");
            }
            Err(e) => return Err(internal(e)),
        }
    }
    Err(StatusCode::INTERNAL_SERVER_ERROR)
}

/// `GET /api/rooms/:code` — look a room up by join code, players included.
pub async fn get_room(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<RoomResponse>, StatusCode> {
    let room = state
        .store
        .room_by_code(&code)
        .await
        .map_err(internal)?
        .ok_or(StatusCode::NOT_FOUND)?;
    let players = state.store.players_in_room(room.id).await.map_err(internal)?;
    Ok(Json(RoomResponse { room, players }))
}

fn internal(err: StoreError) -> StatusCode {
    error!(error = %err, "room route store failure");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;
