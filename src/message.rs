//! Wire protocol — the `{type, payload}` envelope spoken over WebSocket.
//!
//! DESIGN
//! ======
//! Inbound text is parsed in two steps: first to a raw [`Envelope`] (so an
//! unknown `type` tag can be logged and ignored without failing the parse),
//! then the payload is decoded to the typed struct for that tag. Outbound
//! traffic is the [`ServerMessage`] enum, serialized exactly once per
//! broadcast. Everything on the wire is camelCase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ChatMessage, GridState, Player, Room};
use crate::puzzle::SanitizedPuzzle;

// =============================================================================
// ENVELOPE
// =============================================================================

/// Raw bidirectional envelope. `payload` stays untyped until the tag is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

// =============================================================================
// INBOUND PAYLOADS
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub room_code: String,
    pub display_name: String,
    #[serde(default)]
    pub is_spectator: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CellUpdatePayload {
    pub x: usize,
    pub y: usize,
    /// `None` clears the cell.
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorMovePayload {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HintKind {
    /// Reveal the solution letter for one cell.
    Letter,
    /// Report whether the currently filled letter is correct.
    Check,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHintPayload {
    #[serde(rename = "type")]
    pub kind: HintKind,
    pub x: usize,
    pub y: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub clue_id: String,
    pub emoji: String,
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Per-player entry in a `puzzle_completed` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEntry {
    pub user_id: Uuid,
    pub display_name: String,
    pub contribution: i64,
    pub color: String,
}

/// One leaderboard row in a `race_progress` broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RaceStanding {
    pub user_id: Uuid,
    pub display_name: String,
    /// Percent of playable cells correctly filled, 0..=100.
    pub progress: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<usize>,
}

/// Everything the hub can push to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    RoomState {
        room: Room,
        players: Vec<Player>,
        grid_state: Option<GridState>,
        puzzle: Option<SanitizedPuzzle>,
        messages: Vec<ChatMessage>,
    },
    PlayerJoined {
        player: Player,
    },
    PlayerLeft {
        user_id: Uuid,
        display_name: String,
    },
    CellUpdated {
        x: usize,
        y: usize,
        value: Option<String>,
        player_id: Uuid,
        color: String,
    },
    CursorMoved {
        player_id: Uuid,
        display_name: String,
        x: i64,
        y: i64,
        color: String,
    },
    NewMessage {
        id: Uuid,
        user_id: Uuid,
        display_name: String,
        text: String,
        created_at: i64,
    },
    GameStarted,
    PuzzleCompleted {
        solve_time: i64,
        players: Vec<CompletionEntry>,
        completed_at: i64,
    },
    Error {
        message: String,
    },
    ReactionAdded {
        user_id: Uuid,
        clue_id: String,
        emoji: String,
    },
    RaceProgress {
        leaderboard: Vec<RaceStanding>,
    },
    PlayerFinished {
        user_id: Uuid,
        display_name: String,
        solve_time: i64,
        rank: usize,
    },
    TurnChanged {
        current_player_id: Uuid,
        current_player_name: String,
        turn_number: u64,
    },
    HintResult {
        x: usize,
        y: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        correct: Option<bool>,
    },
}

impl ServerMessage {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error { message: message.into() }
    }

    /// Wire tag for this message, as it appears in the envelope.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::RoomState { .. } => "room_state",
            Self::PlayerJoined { .. } => "player_joined",
            Self::PlayerLeft { .. } => "player_left",
            Self::CellUpdated { .. } => "cell_updated",
            Self::CursorMoved { .. } => "cursor_moved",
            Self::NewMessage { .. } => "new_message",
            Self::GameStarted => "game_started",
            Self::PuzzleCompleted { .. } => "puzzle_completed",
            Self::Error { .. } => "error",
            Self::ReactionAdded { .. } => "reaction_added",
            Self::RaceProgress { .. } => "race_progress",
            Self::PlayerFinished { .. } => "player_finished",
            Self::TurnChanged { .. } => "turn_changed",
            Self::HintResult { .. } => "hint_result",
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
