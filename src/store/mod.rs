//! Store collaborator — durable room/player/grid/relay/message state.
//!
//! ARCHITECTURE
//! ============
//! The hub treats persistence as a collaborator behind an async trait so the
//! synchronization logic can be exercised without a database. Production runs
//! use [`pg::PgStore`]; tests and database-less dev runs use
//! [`memory::MemoryStore`]. In-memory session state is authoritative while a
//! room is live; the store is read to hydrate and written back best-effort.

pub mod memory;
pub mod pg;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{ChatMessage, GridState, Player, RelayState, Room, RoomStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("room not found")]
    RoomNotFound,
    #[error("duplicate room code: {0}")]
    DuplicateCode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Persistence surface consumed by the hub. Grid-state calls take an `owner`:
/// `None` addresses the room-shared grid (Collaborative/Relay), `Some(user)`
/// a Race player's private grid.
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError>;
    async fn room_by_id(&self, id: Uuid) -> Result<Option<Room>, StoreError>;
    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, StoreError>;
    async fn set_room_status(&self, id: Uuid, status: RoomStatus) -> Result<(), StoreError>;

    async fn players_in_room(&self, room_id: Uuid) -> Result<Vec<Player>, StoreError>;
    async fn player(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Player>, StoreError>;
    async fn upsert_player(&self, player: &Player) -> Result<(), StoreError>;
    async fn set_player_connected(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        connected: bool,
    ) -> Result<(), StoreError>;
    async fn set_player_cursor(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        x: i64,
        y: i64,
    ) -> Result<(), StoreError>;
    async fn add_contribution(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        amount: i64,
    ) -> Result<(), StoreError>;

    async fn grid_state(
        &self,
        room_id: Uuid,
        owner: Option<Uuid>,
    ) -> Result<Option<GridState>, StoreError>;
    async fn save_grid_state(&self, grid: &GridState) -> Result<(), StoreError>;

    async fn relay_state(&self, room_id: Uuid) -> Result<Option<RelayState>, StoreError>;
    async fn save_relay_state(&self, relay: &RelayState) -> Result<(), StoreError>;

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError>;
    async fn recent_messages(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError>;
}
