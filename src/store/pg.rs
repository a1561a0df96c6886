//! Postgres store and puzzle catalog.
//!
//! Cells, clue lists, and turn orders are stored as JSONB; the row scalars
//! stay relational so lobby queries never have to parse grids.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::model::{
    CellState, ChatMessage, Cursor, GridState, Player, RelayState, Room, RoomStatus,
};
use crate::model::GameMode;
use crate::puzzle::{Clue, Puzzle, PuzzleCatalog};
use crate::store::{Store, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

type RoomRow = (
    Uuid,
    String,
    String,
    String,
    String,
    Uuid,
    Uuid,
    bool,
    i64,
    i64,
);

fn room_from_row(row: RoomRow) -> Result<Room, StoreError> {
    let (id, code, name, mode, status, host_user_id, puzzle_id, allow_hints, turn_time_limit, created_at) =
        row;
    Ok(Room {
        id,
        code,
        name,
        mode: GameMode::parse(&mode)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown game mode: {mode}")))?,
        status: RoomStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown room status: {status}")))?,
        host_user_id,
        puzzle_id,
        allow_hints,
        turn_time_limit,
        created_at,
    })
}

type PlayerRow = (
    Uuid,
    Uuid,
    String,
    String,
    bool,
    bool,
    bool,
    i64,
    Option<i64>,
    Option<i64>,
);

fn player_from_row(row: PlayerRow) -> Player {
    let (room_id, user_id, display_name, color, is_spectator, connected, ready, contribution, cx, cy) =
        row;
    Player {
        user_id,
        room_id,
        display_name,
        color,
        is_spectator,
        connected,
        ready,
        contribution,
        cursor: match (cx, cy) {
            (Some(x), Some(y)) => Some(Cursor { x, y }),
            _ => None,
        },
    }
}

const ROOM_COLUMNS: &str =
    "id, code, name, mode, status, host_user_id, puzzle_id, allow_hints, turn_time_limit, created_at";
const PLAYER_COLUMNS: &str =
    "room_id, user_id, display_name, color, is_spectator, connected, ready, contribution, cursor_x, cursor_y";

/// Shared grids persist under the nil UUID so the (room, owner) key stays
/// non-nullable.
fn owner_key(owner: Option<Uuid>) -> Uuid {
    owner.unwrap_or_else(Uuid::nil)
}

#[async_trait]
impl Store for PgStore {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO rooms (id, code, name, mode, status, host_user_id, puzzle_id, allow_hints, turn_time_limit, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (code) DO NOTHING",
        )
        .bind(room.id)
        .bind(&room.code)
        .bind(&room.name)
        .bind(room.mode.as_str())
        .bind(room.status.as_str())
        .bind(room.host_user_id)
        .bind(room.puzzle_id)
        .bind(room.allow_hints)
        .bind(room.turn_time_limit)
        .bind(room.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::DuplicateCode(room.code.clone()));
        }
        Ok(())
    }

    async fn room_by_id(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query_as::<_, RoomRow>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(room_from_row).transpose()
    }

    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, StoreError> {
        let row = sqlx::query_as::<_, RoomRow>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE upper(code) = upper($1)"
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.map(room_from_row).transpose()
    }

    async fn set_room_status(&self, id: Uuid, status: RoomStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE rooms SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RoomNotFound);
        }
        Ok(())
    }

    async fn players_in_room(&self, room_id: Uuid) -> Result<Vec<Player>, StoreError> {
        let rows = sqlx::query_as::<_, PlayerRow>(&format!(
            "SELECT {PLAYER_COLUMNS} FROM players WHERE room_id = $1 ORDER BY joined_seq ASC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(player_from_row).collect())
    }

    async fn player(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Player>, StoreError> {
        let row = sqlx::query_as::<_, PlayerRow>(&format!(
            "SELECT {PLAYER_COLUMNS} FROM players WHERE room_id = $1 AND user_id = $2"
        ))
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(player_from_row))
    }

    async fn upsert_player(&self, player: &Player) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO players (room_id, user_id, display_name, color, is_spectator, connected, ready, contribution, cursor_x, cursor_y) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT (room_id, user_id) DO UPDATE SET \
                 display_name = EXCLUDED.display_name, \
                 is_spectator = EXCLUDED.is_spectator, \
                 connected = EXCLUDED.connected, \
                 ready = EXCLUDED.ready",
        )
        .bind(player.room_id)
        .bind(player.user_id)
        .bind(&player.display_name)
        .bind(&player.color)
        .bind(player.is_spectator)
        .bind(player.connected)
        .bind(player.ready)
        .bind(player.contribution)
        .bind(player.cursor.map(|c| c.x))
        .bind(player.cursor.map(|c| c.y))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_player_connected(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        connected: bool,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE players SET connected = $3 WHERE room_id = $1 AND user_id = $2")
            .bind(room_id)
            .bind(user_id)
            .bind(connected)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_player_cursor(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        x: i64,
        y: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE players SET cursor_x = $3, cursor_y = $4 WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(x)
        .bind(y)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn add_contribution(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        amount: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE players SET contribution = contribution + $3 WHERE room_id = $1 AND user_id = $2",
        )
        .bind(room_id)
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn grid_state(
        &self,
        room_id: Uuid,
        owner: Option<Uuid>,
    ) -> Result<Option<GridState>, StoreError> {
        let row = sqlx::query_as::<_, (serde_json::Value, serde_json::Value, i64)>(
            "SELECT cells, completed_clues, updated_at FROM grid_states \
             WHERE room_id = $1 AND owner_id = $2",
        )
        .bind(room_id)
        .bind(owner_key(owner))
        .fetch_optional(&self.pool)
        .await?;

        let Some((cells, completed, updated_at)) = row else {
            return Ok(None);
        };
        let cells: Vec<Vec<CellState>> = serde_json::from_value(cells)
            .map_err(|e| StoreError::Corrupt(format!("grid cells: {e}")))?;
        let completed_clues: Vec<String> = serde_json::from_value(completed)
            .map_err(|e| StoreError::Corrupt(format!("completed clues: {e}")))?;
        Ok(Some(GridState { room_id, owner, cells, completed_clues, updated_at }))
    }

    async fn save_grid_state(&self, grid: &GridState) -> Result<(), StoreError> {
        let cells = serde_json::to_value(&grid.cells)
            .map_err(|e| StoreError::Corrupt(format!("grid cells: {e}")))?;
        let completed = serde_json::to_value(&grid.completed_clues)
            .map_err(|e| StoreError::Corrupt(format!("completed clues: {e}")))?;
        sqlx::query(
            "INSERT INTO grid_states (room_id, owner_id, cells, completed_clues, updated_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (room_id, owner_id) DO UPDATE SET \
                 cells = EXCLUDED.cells, \
                 completed_clues = EXCLUDED.completed_clues, \
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(grid.room_id)
        .bind(owner_key(grid.owner))
        .bind(cells)
        .bind(completed)
        .bind(grid.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn relay_state(&self, room_id: Uuid) -> Result<Option<RelayState>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, serde_json::Value, i64, i64, i64)>(
            "SELECT current_player_id, turn_order, turn_started_at, turn_time_limit, words_this_turn \
             FROM relay_states WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((current_player_id, order, turn_started_at, turn_time_limit, words_this_turn)) = row
        else {
            return Ok(None);
        };
        let turn_order: Vec<Uuid> = serde_json::from_value(order)
            .map_err(|e| StoreError::Corrupt(format!("turn order: {e}")))?;
        Ok(Some(RelayState {
            room_id,
            current_player_id,
            turn_order,
            turn_started_at,
            turn_time_limit,
            words_this_turn,
        }))
    }

    async fn save_relay_state(&self, relay: &RelayState) -> Result<(), StoreError> {
        let order = serde_json::to_value(&relay.turn_order)
            .map_err(|e| StoreError::Corrupt(format!("turn order: {e}")))?;
        sqlx::query(
            "INSERT INTO relay_states (room_id, current_player_id, turn_order, turn_started_at, turn_time_limit, words_this_turn) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (room_id) DO UPDATE SET \
                 current_player_id = EXCLUDED.current_player_id, \
                 turn_started_at = EXCLUDED.turn_started_at, \
                 words_this_turn = EXCLUDED.words_this_turn",
        )
        .bind(relay.room_id)
        .bind(relay.current_player_id)
        .bind(order)
        .bind(relay.turn_started_at)
        .bind(relay.turn_time_limit)
        .bind(relay.words_this_turn)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO messages (id, room_id, user_id, display_name, text, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(message.id)
        .bind(message.room_id)
        .bind(message.user_id)
        .bind(&message.display_name)
        .bind(&message.text)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, Uuid, String, String, i64)>(
            "SELECT id, room_id, user_id, display_name, text, created_at FROM ( \
                 SELECT id, room_id, user_id, display_name, text, created_at \
                 FROM messages WHERE room_id = $1 \
                 ORDER BY created_at DESC LIMIT $2 \
             ) tail ORDER BY created_at ASC",
        )
        .bind(room_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, room_id, user_id, display_name, text, created_at)| ChatMessage {
                id,
                room_id,
                user_id,
                display_name,
                text,
                created_at,
            })
            .collect())
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// Postgres-backed puzzle catalog. Puzzles land in this table from the
/// generation pipeline, which is a separate batch concern.
#[derive(Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PuzzleCatalog for PgCatalog {
    async fn puzzle(&self, id: Uuid) -> Result<Option<Puzzle>, StoreError> {
        let row = sqlx::query_as::<_, (String, i64, i64, serde_json::Value, serde_json::Value)>(
            "SELECT title, width, height, grid, clues FROM puzzles WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((title, width, height, grid, clues)) = row else {
            return Ok(None);
        };
        let grid: Vec<Vec<Option<String>>> = serde_json::from_value(grid)
            .map_err(|e| StoreError::Corrupt(format!("puzzle grid: {e}")))?;
        let clues: Vec<Clue> = serde_json::from_value(clues)
            .map_err(|e| StoreError::Corrupt(format!("puzzle clues: {e}")))?;
        Ok(Some(Puzzle {
            id,
            title,
            width: usize::try_from(width).unwrap_or(0),
            height: usize::try_from(height).unwrap_or(0),
            grid,
            clues,
        }))
    }
}
