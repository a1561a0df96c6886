//! In-memory store — tests and database-less dev runs.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{ChatMessage, Cursor, GridState, Player, RelayState, Room, RoomStatus};
use crate::store::{Store, StoreError};

#[derive(Default)]
struct Inner {
    rooms: HashMap<Uuid, Room>,
    /// (room_id, user_id) → player row.
    players: HashMap<(Uuid, Uuid), Player>,
    /// Insertion order of players per room; relay turn order derives from it.
    player_order: HashMap<Uuid, Vec<Uuid>>,
    /// (room_id, owner-or-nil) → grid. `Uuid::nil()` keys the shared grid.
    grids: HashMap<(Uuid, Uuid), GridState>,
    relays: HashMap<Uuid, RelayState>,
    messages: HashMap<Uuid, Vec<ChatMessage>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn owner_key(owner: Option<Uuid>) -> Uuid {
    owner.unwrap_or_else(Uuid::nil)
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.rooms.values().any(|r| r.code == room.code) {
            return Err(StoreError::DuplicateCode(room.code.clone()));
        }
        inner.rooms.insert(room.id, room.clone());
        Ok(())
    }

    async fn room_by_id(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
        Ok(self.inner.read().await.rooms.get(&id).cloned())
    }

    async fn room_by_code(&self, code: &str) -> Result<Option<Room>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .rooms
            .values()
            .find(|r| r.code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn set_room_status(&self, id: Uuid, status: RoomStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let room = inner.rooms.get_mut(&id).ok_or(StoreError::RoomNotFound)?;
        room.status = status;
        Ok(())
    }

    async fn players_in_room(&self, room_id: Uuid) -> Result<Vec<Player>, StoreError> {
        let inner = self.inner.read().await;
        let order = inner.player_order.get(&room_id).cloned().unwrap_or_default();
        Ok(order
            .iter()
            .filter_map(|user_id| inner.players.get(&(room_id, *user_id)).cloned())
            .collect())
    }

    async fn player(&self, room_id: Uuid, user_id: Uuid) -> Result<Option<Player>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .players
            .get(&(room_id, user_id))
            .cloned())
    }

    async fn upsert_player(&self, player: &Player) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (player.room_id, player.user_id);
        if !inner.players.contains_key(&key) {
            inner
                .player_order
                .entry(player.room_id)
                .or_default()
                .push(player.user_id);
        }
        inner.players.insert(key, player.clone());
        Ok(())
    }

    async fn set_player_connected(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        connected: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(player) = inner.players.get_mut(&(room_id, user_id)) {
            player.connected = connected;
        }
        Ok(())
    }

    async fn set_player_cursor(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        x: i64,
        y: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(player) = inner.players.get_mut(&(room_id, user_id)) {
            player.cursor = Some(Cursor { x, y });
        }
        Ok(())
    }

    async fn add_contribution(
        &self,
        room_id: Uuid,
        user_id: Uuid,
        amount: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(player) = inner.players.get_mut(&(room_id, user_id)) {
            player.contribution += amount;
        }
        Ok(())
    }

    async fn grid_state(
        &self,
        room_id: Uuid,
        owner: Option<Uuid>,
    ) -> Result<Option<GridState>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .grids
            .get(&(room_id, owner_key(owner)))
            .cloned())
    }

    async fn save_grid_state(&self, grid: &GridState) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .grids
            .insert((grid.room_id, owner_key(grid.owner)), grid.clone());
        Ok(())
    }

    async fn relay_state(&self, room_id: Uuid) -> Result<Option<RelayState>, StoreError> {
        Ok(self.inner.read().await.relays.get(&room_id).cloned())
    }

    async fn save_relay_state(&self, relay: &RelayState) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .relays
            .insert(relay.room_id, relay.clone());
        Ok(())
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .messages
            .entry(message.room_id)
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn recent_messages(
        &self,
        room_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let inner = self.inner.read().await;
        let all = inner.messages.get(&room_id).cloned().unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all.into_iter().skip(skip).collect())
    }
}
