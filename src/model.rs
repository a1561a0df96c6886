//! Persisted domain rows shared by the store and the hub.
//!
//! DESIGN
//! ======
//! These structs mirror the database tables one-to-one and double as wire
//! payload fragments (`room_state.players`, `player_joined.player`, ...), so
//! they serialize in the camelCase shape clients expect. Handlers always work
//! on value snapshots of these rows — never on references into the store —
//! so broadcast payloads can't alias mutable persisted state.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Current time as milliseconds since Unix epoch. All wire timestamps use this.
#[must_use]
pub fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(0)
}

// =============================================================================
// ENUMS
// =============================================================================

/// How a room plays out. Fixed at creation, drives cell-update authorization,
/// progress computation, and completion detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GameMode {
    Collaborative,
    Race,
    Relay,
}

impl GameMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Collaborative => "collaborative",
            Self::Race => "race",
            Self::Relay => "relay",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collaborative" => Some(Self::Collaborative),
            "race" => Some(Self::Race),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

/// Room lifecycle: Lobby → Active → Completed, transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Lobby,
    Active,
    Completed,
}

impl RoomStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lobby => "lobby",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lobby" => Some(Self::Lobby),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

// =============================================================================
// ROOM / PLAYER
// =============================================================================

/// Persisted room row. `code` is the short human-shareable join code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub mode: GameMode,
    pub status: RoomStatus,
    pub host_user_id: Uuid,
    pub puzzle_id: Uuid,
    pub allow_hints: bool,
    /// Relay turn budget in seconds. Ignored outside Relay mode.
    pub turn_time_limit: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub x: i64,
    pub y: i64,
}

/// Persisted per-room player row. Survives disconnects; `connected` tracks
/// whether any live connection for this user is currently in the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub user_id: Uuid,
    pub room_id: Uuid,
    pub display_name: String,
    pub color: String,
    pub is_spectator: bool,
    pub connected: bool,
    pub ready: bool,
    pub contribution: i64,
    pub cursor: Option<Cursor>,
}

// =============================================================================
// GRID STATE
// =============================================================================

/// One cell of a live grid.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellState {
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub revealed: bool,
    /// Set only by the hint paths; everyday writes never mark correctness.
    #[serde(default)]
    pub correct: Option<bool>,
    #[serde(default)]
    pub last_editor: Option<Uuid>,
}

/// A room's fill-in state. Shared (owner = None) in Collaborative and Relay,
/// one per non-spectator player (owner = Some) in Race.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GridState {
    pub room_id: Uuid,
    pub owner: Option<Uuid>,
    pub cells: Vec<Vec<CellState>>,
    pub completed_clues: Vec<String>,
    pub updated_at: i64,
}

impl GridState {
    /// Fresh empty grid sized to the puzzle.
    #[must_use]
    pub fn empty(room_id: Uuid, owner: Option<Uuid>, width: usize, height: usize) -> Self {
        Self {
            room_id,
            owner,
            cells: vec![vec![CellState::default(); width]; height],
            completed_clues: Vec::new(),
            updated_at: now_ms(),
        }
    }

    #[must_use]
    pub fn cell(&self, x: usize, y: usize) -> Option<&CellState> {
        self.cells.get(y).and_then(|row| row.get(x))
    }

    pub fn cell_mut(&mut self, x: usize, y: usize) -> Option<&mut CellState> {
        self.cells.get_mut(y).and_then(|row| row.get_mut(x))
    }
}

// =============================================================================
// RELAY STATE
// =============================================================================

/// Persisted relay turn bookkeeping. Invariant: `current_player_id` is always
/// a member of `turn_order`, which is fixed once at game start.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayState {
    pub room_id: Uuid,
    pub current_player_id: Uuid,
    pub turn_order: Vec<Uuid>,
    pub turn_started_at: i64,
    pub turn_time_limit: i64,
    pub words_this_turn: i64,
}

impl RelayState {
    /// The player after `current_player_id` in the fixed order, wrapping.
    #[must_use]
    pub fn next_player(&self) -> Option<Uuid> {
        let idx = self
            .turn_order
            .iter()
            .position(|id| *id == self.current_player_id)?;
        let next = (idx + 1) % self.turn_order.len();
        self.turn_order.get(next).copied()
    }
}

// =============================================================================
// CHAT
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub display_name: String,
    pub text: String,
    pub created_at: i64,
}
