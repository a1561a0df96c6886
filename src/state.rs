//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! holds the store/catalog collaborators, the connection registry handle, and
//! the directory of live room sessions.
//!
//! LOCKING
//! =======
//! Two levels: the directory `RwLock` is held only long enough to find or
//! create a session; each session's own `Mutex` guards its member set and
//! mode-specific fields. The order is always directory before session, never
//! the reverse, so the two levels cannot deadlock.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::model::{GameMode, Room};
use crate::puzzle::PuzzleCatalog;
use crate::registry::{OutboundSender, RegistryHandle};
use crate::store::Store;

// =============================================================================
// ROOM SESSION
// =============================================================================

/// A connection's room-local membership entry. A value snapshot — never a
/// reference into the registry or the store.
#[derive(Debug, Clone)]
pub struct SessionMember {
    pub user_id: Uuid,
    pub display_name: String,
    pub tx: OutboundSender,
}

/// In-memory runtime state for a room while at least one connection is
/// joined. Created lazily on first join, evicted when the member set empties.
/// Persisted Room/Player rows are untouched by eviction.
pub struct RoomSession {
    pub room_id: Uuid,
    pub code: String,
    pub mode: GameMode,
    /// conn_id → member. Distinct from persisted player membership.
    pub members: HashMap<Uuid, SessionMember>,
    /// Set by `start_game`, ms since epoch.
    pub started_at: Option<i64>,
    /// Race: user ids in finish order. Ordered, no duplicates.
    pub finish_order: Vec<Uuid>,
    /// Race: ms-since-epoch finish timestamps keyed by user id.
    pub finish_times: HashMap<Uuid, i64>,
    /// Relay: turn counter, starts at 1 when the game starts.
    pub turn_number: u64,
    /// Relay: set while a turn-expiry watchdog task is alive for this room.
    pub relay_timer_running: bool,
    /// Latched by the first successful completion so the check is idempotent.
    pub completed: bool,
}

impl RoomSession {
    #[must_use]
    pub fn new(room: &Room) -> Self {
        Self {
            room_id: room.id,
            code: room.code.clone(),
            mode: room.mode,
            members: HashMap::new(),
            started_at: None,
            finish_order: Vec::new(),
            finish_times: HashMap::new(),
            turn_number: 0,
            relay_timer_running: false,
            completed: false,
        }
    }

    /// Does this user have any other connection in the room besides `conn_id`?
    #[must_use]
    pub fn user_has_other_connection(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        self.members
            .iter()
            .any(|(id, m)| *id != conn_id && m.user_id == user_id)
    }
}

pub type SharedSession = Arc<Mutex<RoomSession>>;

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum — all inner fields are
/// Arc-wrapped or cheap-clone handles.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub puzzles: Arc<dyn PuzzleCatalog>,
    pub rooms: Arc<RwLock<HashMap<Uuid, SharedSession>>>,
    pub registry: RegistryHandle,
    pub config: Arc<HubConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        puzzles: Arc<dyn PuzzleCatalog>,
        registry: RegistryHandle,
        config: HubConfig,
    ) -> Self {
        Self {
            store,
            puzzles,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            registry,
            config: Arc::new(config),
        }
    }

    /// Live session for a room, if any connection is currently joined.
    pub async fn session(&self, room_id: Uuid) -> Option<SharedSession> {
        self.rooms.read().await.get(&room_id).cloned()
    }

    /// Find or lazily create the session for a room. The directory write
    /// lock is held only for the map entry, never across store calls.
    pub async fn session_or_create(&self, room: &Room) -> SharedSession {
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room.id)
            .or_insert_with(|| Arc::new(Mutex::new(RoomSession::new(room))))
            .clone()
    }

    /// Evict the session if its member set is empty. Returns true on evict.
    pub async fn remove_session_if_empty(&self, room_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(session) = rooms.get(&room_id) else {
            return false;
        };
        let empty = session.lock().await.members.is_empty();
        if empty {
            rooms.remove(&room_id);
        }
        empty
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use super::*;
    use async_trait::async_trait;
    use axum::extract::ws::Utf8Bytes;
    use tokio::sync::mpsc;

    use crate::model::{ChatMessage, GridState, Player, RelayState, RoomStatus, now_ms};
    use crate::puzzle::MemoryCatalog;
    use crate::registry::spawn_registry;
    use crate::store::StoreError;
    use crate::store::memory::MemoryStore;

    /// `AppState` over the in-memory store plus the id of the seeded demo
    /// puzzle.
    #[must_use]
    pub fn test_app_state() -> (AppState, Uuid) {
        let (catalog, puzzle_id) = MemoryCatalog::with_demo();
        let state = AppState::new(
            Arc::new(MemoryStore::new()),
            Arc::new(catalog),
            spawn_registry(),
            HubConfig::default(),
        );
        (state, puzzle_id)
    }

    /// Persist a fresh lobby room and return it.
    pub async fn seed_room(state: &AppState, mode: GameMode, puzzle_id: Uuid) -> Room {
        let room = Room {
            id: Uuid::new_v4(),
            code: format!("R{}", &Uuid::new_v4().simple().to_string()[..5].to_uppercase()),
            name: "Test Room".into(),
            mode,
            status: RoomStatus::Lobby,
            host_user_id: Uuid::new_v4(),
            puzzle_id,
            allow_hints: true,
            turn_time_limit: 60,
            created_at: now_ms(),
        };
        state.store.create_room(&room).await.expect("seed room");
        room
    }

    /// Persist a player row for a room.
    pub async fn seed_player(
        state: &AppState,
        room: &Room,
        user_id: Uuid,
        name: &str,
        is_spectator: bool,
    ) -> Player {
        let player = Player {
            user_id,
            room_id: room.id,
            display_name: name.into(),
            color: "#3cb44b".into(),
            is_spectator,
            connected: true,
            ready: false,
            contribution: 0,
            cursor: None,
        };
        state.store.upsert_player(&player).await.expect("seed player");
        player
    }

    /// [`MemoryStore`] wrapper with latency and fault injection, for tests
    /// that need store calls to stall (as a real database round trip does)
    /// or fail mid-operation.
    pub struct StoreProxy {
        inner: MemoryStore,
        pub grid_read_delay: Duration,
        pub fail_message_reads: AtomicBool,
    }

    impl Default for StoreProxy {
        fn default() -> Self {
            Self::new()
        }
    }

    impl StoreProxy {
        #[must_use]
        pub fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                grid_read_delay: Duration::ZERO,
                fail_message_reads: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Store for StoreProxy {
        async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
            self.inner.create_room(room).await
        }
        async fn room_by_id(&self, id: Uuid) -> Result<Option<Room>, StoreError> {
            self.inner.room_by_id(id).await
        }
        async fn room_by_code(&self, code: &str) -> Result<Option<Room>, StoreError> {
            self.inner.room_by_code(code).await
        }
        async fn set_room_status(&self, id: Uuid, status: RoomStatus) -> Result<(), StoreError> {
            self.inner.set_room_status(id, status).await
        }
        async fn players_in_room(&self, room_id: Uuid) -> Result<Vec<Player>, StoreError> {
            self.inner.players_in_room(room_id).await
        }
        async fn player(
            &self,
            room_id: Uuid,
            user_id: Uuid,
        ) -> Result<Option<Player>, StoreError> {
            self.inner.player(room_id, user_id).await
        }
        async fn upsert_player(&self, player: &Player) -> Result<(), StoreError> {
            self.inner.upsert_player(player).await
        }
        async fn set_player_connected(
            &self,
            room_id: Uuid,
            user_id: Uuid,
            connected: bool,
        ) -> Result<(), StoreError> {
            self.inner.set_player_connected(room_id, user_id, connected).await
        }
        async fn set_player_cursor(
            &self,
            room_id: Uuid,
            user_id: Uuid,
            x: i64,
            y: i64,
        ) -> Result<(), StoreError> {
            self.inner.set_player_cursor(room_id, user_id, x, y).await
        }
        async fn add_contribution(
            &self,
            room_id: Uuid,
            user_id: Uuid,
            amount: i64,
        ) -> Result<(), StoreError> {
            self.inner.add_contribution(room_id, user_id, amount).await
        }
        async fn grid_state(
            &self,
            room_id: Uuid,
            owner: Option<Uuid>,
        ) -> Result<Option<GridState>, StoreError> {
            if self.grid_read_delay > Duration::ZERO {
                tokio::time::sleep(self.grid_read_delay).await;
            }
            self.inner.grid_state(room_id, owner).await
        }
        async fn save_grid_state(&self, grid: &GridState) -> Result<(), StoreError> {
            self.inner.save_grid_state(grid).await
        }
        async fn relay_state(&self, room_id: Uuid) -> Result<Option<RelayState>, StoreError> {
            self.inner.relay_state(room_id).await
        }
        async fn save_relay_state(&self, relay: &RelayState) -> Result<(), StoreError> {
            self.inner.save_relay_state(relay).await
        }
        async fn append_message(&self, message: &ChatMessage) -> Result<(), StoreError> {
            self.inner.append_message(message).await
        }
        async fn recent_messages(
            &self,
            room_id: Uuid,
            limit: usize,
        ) -> Result<Vec<ChatMessage>, StoreError> {
            if self.fail_message_reads.load(Ordering::Relaxed) {
                return Err(StoreError::Corrupt("message history unavailable".into()));
            }
            self.inner.recent_messages(room_id, limit).await
        }
    }

    /// `AppState` over a [`StoreProxy`] plus the proxy handle and the seeded
    /// demo puzzle id.
    #[must_use]
    pub fn proxied_app_state(proxy: StoreProxy) -> (AppState, Arc<StoreProxy>, Uuid) {
        let proxy = Arc::new(proxy);
        let (catalog, puzzle_id) = MemoryCatalog::with_demo();
        let state = AppState::new(
            proxy.clone(),
            Arc::new(catalog),
            spawn_registry(),
            HubConfig::default(),
        );
        (state, proxy, puzzle_id)
    }

    /// Attach a member directly to a session, returning the connection id
    /// and the receiving end of its outbound queue.
    pub async fn attach_member(
        session: &SharedSession,
        user_id: Uuid,
        name: &str,
    ) -> (Uuid, mpsc::Receiver<Utf8Bytes>) {
        let (tx, rx) = mpsc::channel(32);
        let conn_id = Uuid::new_v4();
        session.lock().await.members.insert(
            conn_id,
            SessionMember { user_id, display_name: name.into(), tx },
        );
        (conn_id, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::*;

    #[tokio::test]
    async fn session_is_created_lazily_and_reused() {
        let (state, puzzle_id) = test_app_state();
        let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;

        assert!(state.session(room.id).await.is_none());
        let first = state.session_or_create(&room).await;
        let second = state.session_or_create(&room).await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn empty_session_is_evicted_but_rows_remain() {
        let (state, puzzle_id) = test_app_state();
        let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;
        let session = state.session_or_create(&room).await;

        let (conn_id, _rx) = attach_member(&session, Uuid::new_v4(), "Ada").await;
        assert!(!state.remove_session_if_empty(room.id).await);

        session.lock().await.members.remove(&conn_id);
        assert!(state.remove_session_if_empty(room.id).await);
        assert!(state.session(room.id).await.is_none());

        // Persisted room row is untouched by eviction.
        let stored = state.store.room_by_id(room.id).await.unwrap();
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn other_connection_detection_is_per_user() {
        let (state, puzzle_id) = test_app_state();
        let room = seed_room(&state, GameMode::Collaborative, puzzle_id).await;
        let session = state.session_or_create(&room).await;

        let user = Uuid::new_v4();
        let (tab_a, _rx_a) = attach_member(&session, user, "Ada").await;
        let (tab_b, _rx_b) = attach_member(&session, user, "Ada").await;
        let (other, _rx_c) = attach_member(&session, Uuid::new_v4(), "Grace").await;

        let locked = session.lock().await;
        assert!(locked.user_has_other_connection(user, tab_a));
        assert!(locked.user_has_other_connection(user, tab_b));
        let solo = locked.members.get(&other).unwrap().user_id;
        assert!(!locked.user_has_other_connection(solo, other));
    }
}
