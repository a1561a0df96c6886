//! Game service — mode state machines, completion detection, and turns.
//!
//! DESIGN
//! ======
//! All three game modes share one write primitive (`write_cell`) and differ
//! in authorization and fan-out:
//! - Collaborative: one shared grid, unconditional last-write-wins, full
//!   room broadcast, completion check after every accepted write.
//! - Race: one private grid per non-spectator, echo to the actor only,
//!   leaderboard recompute + broadcast after every write.
//! - Relay: the collaborative path gated on the current turn holder.
//!
//! Completion must fire exactly once; the session's `completed` latch (under
//! the session lock) plus the Active-status precondition make the check
//! idempotent.

use std::cmp::Reverse;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::message::{CompletionEntry, HintKind, RaceStanding, ServerMessage};
use crate::model::{GameMode, GridState, Player, RelayState, Room, RoomStatus, now_ms};
use crate::puzzle::Puzzle;
use crate::registry::Connection;
use crate::services::room::{broadcast_session, send_to_one};
use crate::state::{AppState, RoomSession};
use crate::store::StoreError;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum GameError {
    #[error("room not found")]
    RoomNotFound,
    #[error("puzzle not found")]
    PuzzleMissing,
    #[error("only the host can start the game")]
    NotHost,
    #[error("game already started")]
    AlreadyStarted,
    #[error("game is not active")]
    NotActive,
    #[error("not your turn")]
    NotYourTurn,
    #[error("hints disabled")]
    HintsDisabled,
    #[error("spectators cannot edit the grid")]
    SpectatorEdit,
    #[error("not a relay room")]
    NotRelay,
    #[error("cannot start with no players")]
    NoPlayers,
    #[error("relay state missing")]
    RelayMissing,
    #[error("cell is not playable")]
    InvalidCell,
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

async fn load_room(state: &AppState, room_id: Uuid) -> Result<Room, GameError> {
    state
        .store
        .room_by_id(room_id)
        .await?
        .ok_or(GameError::RoomNotFound)
}

async fn load_puzzle(state: &AppState, room: &Room) -> Result<Puzzle, GameError> {
    state
        .puzzles
        .puzzle(room.puzzle_id)
        .await?
        .ok_or(GameError::PuzzleMissing)
}

// =============================================================================
// START GAME
// =============================================================================

/// Host-only Lobby→Active transition. Seeds mode-specific structures: Race
/// gets an empty private grid per non-spectator, Relay gets its fixed turn
/// order and an initial `turn_changed`. All modes broadcast `game_started`.
pub async fn start_game(state: &AppState, room_id: Uuid, user_id: Uuid) -> Result<(), GameError> {
    let room = load_room(state, room_id).await?;
    if user_id != room.host_user_id {
        return Err(GameError::NotHost);
    }
    if room.status != RoomStatus::Lobby {
        return Err(GameError::AlreadyStarted);
    }
    let puzzle = load_puzzle(state, &room).await?;

    let players = state.store.players_in_room(room_id).await?;
    let solvers: Vec<&Player> = players.iter().filter(|p| !p.is_spectator).collect();
    if solvers.is_empty() {
        return Err(GameError::NoPlayers);
    }

    state
        .store
        .set_room_status(room_id, RoomStatus::Active)
        .await?;
    let session = state.session(room_id).await.ok_or(GameError::RoomNotFound)?;
    let now = now_ms();

    let first_turn = match room.mode {
        GameMode::Collaborative => None,
        GameMode::Race => {
            for player in &solvers {
                let grid =
                    GridState::empty(room_id, Some(player.user_id), puzzle.width, puzzle.height);
                if let Err(e) = state.store.save_grid_state(&grid).await {
                    warn!(error = %e, %room_id, user_id = %player.user_id, "failed to seed race grid");
                }
            }
            None
        }
        GameMode::Relay => {
            // Turn order is fixed at start: non-spectators in join order.
            let relay = RelayState {
                room_id,
                current_player_id: solvers[0].user_id,
                turn_order: solvers.iter().map(|p| p.user_id).collect(),
                turn_started_at: now,
                turn_time_limit: room.turn_time_limit,
                words_this_turn: 0,
            };
            state.store.save_relay_state(&relay).await?;
            Some((solvers[0].user_id, solvers[0].display_name.clone()))
        }
    };

    let mut session = session.lock().await;
    session.started_at = Some(now);
    if let Some((current_id, current_name)) = first_turn {
        session.turn_number = 1;
        broadcast_session(
            &session,
            &ServerMessage::TurnChanged {
                current_player_id: current_id,
                current_player_name: current_name,
                turn_number: 1,
            },
            None,
        );
        if !session.relay_timer_running {
            session.relay_timer_running = true;
            let _ = spawn_relay_timer(state.clone(), room_id);
        }
    }
    broadcast_session(&session, &ServerMessage::GameStarted, None);
    info!(%room_id, mode = room.mode.as_str(), "game started");
    Ok(())
}

// =============================================================================
// CELL UPDATES
// =============================================================================

/// Apply a cell update per the room's mode. Updates against rooms that do
/// not exist or are not Active are silently dropped.
pub async fn cell_update(
    state: &AppState,
    conn: &Connection,
    room_id: Uuid,
    x: usize,
    y: usize,
    value: Option<String>,
) -> Result<(), GameError> {
    let Some(room) = state.store.room_by_id(room_id).await? else {
        return Ok(());
    };
    if room.status != RoomStatus::Active {
        return Ok(());
    }
    let Some(player) = state.store.player(room_id, conn.user_id).await? else {
        return Ok(());
    };
    if player.is_spectator {
        return Err(GameError::SpectatorEdit);
    }
    let puzzle = load_puzzle(state, &room).await?;
    if !puzzle.is_playable(x, y) {
        return Err(GameError::InvalidCell);
    }

    match room.mode {
        GameMode::Collaborative => {
            shared_write(state, conn, &room, &puzzle, &player, x, y, value, false).await?;
        }
        GameMode::Relay => {
            relay_gated_write(state, conn, &room, &puzzle, &player, x, y, value, false).await?;
        }
        GameMode::Race => {
            race_write(state, conn, &room, &puzzle, &player, x, y, value, false).await?;
        }
    }
    Ok(())
}

/// Mutate one cell and record any clue entries newly completed by the write.
/// Returns how many clues were completed.
fn write_cell(
    grid: &mut GridState,
    puzzle: &Puzzle,
    editor: Uuid,
    x: usize,
    y: usize,
    value: Option<String>,
    revealed: bool,
) -> i64 {
    if let Some(cell) = grid.cell_mut(x, y) {
        cell.value = value;
        cell.last_editor = Some(editor);
        if revealed {
            cell.revealed = true;
            cell.correct = Some(true);
        } else {
            // A manual write invalidates any earlier correctness mark.
            cell.correct = None;
        }
    }
    grid.updated_at = now_ms();

    let mut newly_completed = 0;
    for clue in puzzle.clues_at(x, y) {
        if puzzle.clue_solved(clue, grid) && !grid.completed_clues.contains(&clue.id) {
            grid.completed_clues.push(clue.id.clone());
            newly_completed += 1;
        }
    }
    newly_completed
}

/// Collaborative/Relay write path: shared grid, full-room broadcast, then
/// the completion check. Returns the count of clues completed by the write.
#[allow(clippy::too_many_arguments)]
async fn shared_write(
    state: &AppState,
    conn: &Connection,
    room: &Room,
    puzzle: &Puzzle,
    player: &Player,
    x: usize,
    y: usize,
    value: Option<String>,
    revealed: bool,
) -> Result<i64, GameError> {
    // Writes only arrive from joined connections, so a missing session means
    // nobody is left in the room.
    let Some(session) = state.session(room.id).await else {
        return Ok(0);
    };
    let mut session = session.lock().await;
    shared_write_locked(state, &mut session, conn, room, puzzle, player, x, y, value, revealed)
        .await
}

/// Caller holds the session lock, which serializes every read-modify-write
/// of the shared grid; without it two concurrent writers would each load the
/// grid and the later save would erase the earlier cell.
#[allow(clippy::too_many_arguments)]
async fn shared_write_locked(
    state: &AppState,
    session: &mut RoomSession,
    conn: &Connection,
    room: &Room,
    puzzle: &Puzzle,
    player: &Player,
    x: usize,
    y: usize,
    value: Option<String>,
    revealed: bool,
) -> Result<i64, GameError> {
    let mut grid = match state.store.grid_state(room.id, None).await? {
        Some(grid) => grid,
        None => GridState::empty(room.id, None, puzzle.width, puzzle.height),
    };
    let newly_completed = write_cell(&mut grid, puzzle, conn.user_id, x, y, value.clone(), revealed);
    if let Err(e) = state.store.save_grid_state(&grid).await {
        warn!(error = %e, room_id = %room.id, "grid persist failed; live session continues");
    }

    broadcast_session(
        session,
        &ServerMessage::CellUpdated {
            x,
            y,
            value,
            player_id: conn.user_id,
            color: player.color.clone(),
        },
        None,
    );

    if !session.completed && puzzle.is_solved_by(&grid) {
        session.completed = true;
        finish_shared(state, session, room, puzzle, &grid).await;
    }
    Ok(newly_completed)
}

/// Exactly-once shared-grid completion: room → Completed, per-player solve
/// time and contribution, one `puzzle_completed` broadcast. Caller holds the
/// session lock and has already latched `session.completed`.
async fn finish_shared(
    state: &AppState,
    session: &RoomSession,
    room: &Room,
    puzzle: &Puzzle,
    grid: &GridState,
) {
    if let Err(e) = state
        .store
        .set_room_status(room.id, RoomStatus::Completed)
        .await
    {
        warn!(error = %e, room_id = %room.id, "failed to persist completed status");
    }

    let now = now_ms();
    let started = session.started_at.unwrap_or(room.created_at);
    let total = puzzle.playable_count().max(1);
    let players = state
        .store
        .players_in_room(room.id)
        .await
        .unwrap_or_default();

    let mut entries = Vec::new();
    for player in players.iter().filter(|p| !p.is_spectator) {
        let edited = grid
            .cells
            .iter()
            .flatten()
            .filter(|cell| cell.last_editor == Some(player.user_id))
            .count();
        let contribution = i64::try_from(edited * 100 / total).unwrap_or(0);
        if let Err(e) = state
            .store
            .add_contribution(room.id, player.user_id, contribution)
            .await
        {
            warn!(error = %e, room_id = %room.id, user_id = %player.user_id, "contribution persist failed");
        }
        entries.push(CompletionEntry {
            user_id: player.user_id,
            display_name: player.display_name.clone(),
            contribution,
            color: player.color.clone(),
        });
    }

    broadcast_session(
        session,
        &ServerMessage::PuzzleCompleted {
            solve_time: now - started,
            players: entries,
            completed_at: now,
        },
        None,
    );
    info!(room_id = %room.id, "puzzle completed");
}

/// Relay: the collaborative path, gated on the turn holder. Completed clues
/// count toward the current turn's word tally.
#[allow(clippy::too_many_arguments)]
async fn relay_gated_write(
    state: &AppState,
    conn: &Connection,
    room: &Room,
    puzzle: &Puzzle,
    player: &Player,
    x: usize,
    y: usize,
    value: Option<String>,
    revealed: bool,
) -> Result<(), GameError> {
    let Some(session) = state.session(room.id).await else {
        return Ok(());
    };
    // The lock covers the turn check, the grid write, and the word tally, so
    // a concurrent pass or edit cannot interleave between them.
    let mut session = session.lock().await;
    let mut relay = state
        .store
        .relay_state(room.id)
        .await?
        .ok_or(GameError::RelayMissing)?;
    if relay.current_player_id != conn.user_id {
        return Err(GameError::NotYourTurn);
    }

    let newly_completed =
        shared_write_locked(state, &mut session, conn, room, puzzle, player, x, y, value, revealed)
            .await?;
    if newly_completed > 0 {
        relay.words_this_turn += newly_completed;
        if let Err(e) = state.store.save_relay_state(&relay).await {
            warn!(error = %e, room_id = %room.id, "relay word tally persist failed");
        }
    }
    Ok(())
}

/// Race write path: private grid (created on first write), echo to the actor
/// only, then a full leaderboard recompute and broadcast.
#[allow(clippy::too_many_arguments)]
async fn race_write(
    state: &AppState,
    conn: &Connection,
    room: &Room,
    puzzle: &Puzzle,
    player: &Player,
    x: usize,
    y: usize,
    value: Option<String>,
    revealed: bool,
) -> Result<(), GameError> {
    let Some(session) = state.session(room.id).await else {
        return Ok(());
    };
    // Same rule as the shared grid: the racer's two tabs may write at once,
    // so the private grid's read-modify-write stays under the session lock.
    let mut session = session.lock().await;
    let mut grid = match state.store.grid_state(room.id, Some(conn.user_id)).await? {
        Some(grid) => grid,
        None => GridState::empty(room.id, Some(conn.user_id), puzzle.width, puzzle.height),
    };
    write_cell(&mut grid, puzzle, conn.user_id, x, y, value.clone(), revealed);
    if let Err(e) = state.store.save_grid_state(&grid).await {
        warn!(error = %e, room_id = %room.id, user_id = %conn.user_id, "race grid persist failed");
    }

    // Core race invariant: the cell goes back to the acting connection only.
    send_to_one(
        &conn.tx,
        &ServerMessage::CellUpdated {
            x,
            y,
            value,
            player_id: conn.user_id,
            color: player.color.clone(),
        },
    );

    broadcast_race_progress(state, &mut session, room, puzzle, Some((conn.user_id, &grid))).await
}

/// Recompute every non-spectator's percent-correct, announce first-time
/// finishes with their rank, broadcast the full leaderboard, and complete
/// the room once everyone has finished.
async fn broadcast_race_progress(
    state: &AppState,
    session: &mut RoomSession,
    room: &Room,
    puzzle: &Puzzle,
    fresh: Option<(Uuid, &GridState)>,
) -> Result<(), GameError> {
    let players = state.store.players_in_room(room.id).await?;
    let racers: Vec<&Player> = players.iter().filter(|p| !p.is_spectator).collect();
    if racers.is_empty() {
        return Ok(());
    }

    let now = now_ms();
    let started = session.started_at.unwrap_or(room.created_at);

    let mut leaderboard = Vec::new();
    for player in &racers {
        let progress = match fresh.filter(|(user_id, _)| *user_id == player.user_id) {
            Some((_, grid)) => puzzle.percent_correct(grid),
            None => match state.store.grid_state(room.id, Some(player.user_id)).await {
                Ok(Some(grid)) => puzzle.percent_correct(&grid),
                Ok(None) => 0,
                Err(e) => {
                    warn!(error = %e, room_id = %room.id, user_id = %player.user_id, "race grid read failed");
                    0
                }
            },
        };

        // First time at 100%: record the finish exactly once.
        if progress == 100 && !session.finish_order.contains(&player.user_id) {
            session.finish_order.push(player.user_id);
            session.finish_times.insert(player.user_id, now);
            let rank = session.finish_order.len();
            broadcast_session(
                session,
                &ServerMessage::PlayerFinished {
                    user_id: player.user_id,
                    display_name: player.display_name.clone(),
                    solve_time: now - started,
                    rank,
                },
                None,
            );
        }

        let finished_at = session.finish_times.get(&player.user_id).copied();
        leaderboard.push(RaceStanding {
            user_id: player.user_id,
            display_name: player.display_name.clone(),
            progress,
            finished_at,
            solve_time: finished_at.map(|t| t - started),
            rank: session
                .finish_order
                .iter()
                .position(|id| *id == player.user_id)
                .map(|i| i + 1),
        });
    }
    leaderboard.sort_by_key(|row| (row.rank.unwrap_or(usize::MAX), Reverse(row.progress)));
    broadcast_session(session, &ServerMessage::RaceProgress { leaderboard }, None);

    let all_finished = racers
        .iter()
        .all(|p| session.finish_order.contains(&p.user_id));
    if all_finished && !session.completed {
        session.completed = true;
        if let Err(e) = state
            .store
            .set_room_status(room.id, RoomStatus::Completed)
            .await
        {
            warn!(error = %e, room_id = %room.id, "failed to persist completed status");
        }

        // Final standings by finish order: earlier finisher, higher score.
        let n = session.finish_order.len().max(1);
        let mut entries = Vec::new();
        for (index, user_id) in session.finish_order.iter().enumerate() {
            let Some(player) = racers.iter().find(|p| p.user_id == *user_id) else {
                continue;
            };
            let contribution = i64::try_from((n - index) * 100 / n).unwrap_or(0);
            if let Err(e) = state
                .store
                .add_contribution(room.id, *user_id, contribution)
                .await
            {
                warn!(error = %e, room_id = %room.id, %user_id, "contribution persist failed");
            }
            entries.push(CompletionEntry {
                user_id: *user_id,
                display_name: player.display_name.clone(),
                contribution,
                color: player.color.clone(),
            });
        }
        broadcast_session(
            session,
            &ServerMessage::PuzzleCompleted {
                solve_time: now - started,
                players: entries,
                completed_at: now,
            },
            None,
        );
        info!(room_id = %room.id, "race completed");
    }
    Ok(())
}

// =============================================================================
// TURNS (RELAY)
// =============================================================================

/// Current player passes the turn: cyclic advance through the fixed order.
pub async fn pass_turn(state: &AppState, room_id: Uuid, user_id: Uuid) -> Result<(), GameError> {
    let room = load_room(state, room_id).await?;
    if room.mode != GameMode::Relay {
        return Err(GameError::NotRelay);
    }
    if room.status != RoomStatus::Active {
        return Err(GameError::NotActive);
    }
    let Some(session) = state.session(room_id).await else {
        return Ok(());
    };
    let mut session = session.lock().await;
    let relay = state
        .store
        .relay_state(room_id)
        .await?
        .ok_or(GameError::RelayMissing)?;
    if relay.current_player_id != user_id {
        return Err(GameError::NotYourTurn);
    }
    advance_turn(state, &mut session, &room, relay).await
}

/// Rotate to the next player: reset the turn clock and word counter, bump
/// the session turn number, broadcast `turn_changed`. Caller holds the
/// session lock so the relay row cannot be rewritten mid-rotation.
async fn advance_turn(
    state: &AppState,
    session: &mut RoomSession,
    room: &Room,
    mut relay: RelayState,
) -> Result<(), GameError> {
    let next = relay.next_player().ok_or(GameError::RelayMissing)?;
    relay.current_player_id = next;
    relay.turn_started_at = now_ms();
    relay.words_this_turn = 0;
    state.store.save_relay_state(&relay).await?;

    let next_name = match state.store.player(room.id, next).await {
        Ok(Some(player)) => player.display_name,
        _ => String::new(),
    };

    session.turn_number += 1;
    broadcast_session(
        session,
        &ServerMessage::TurnChanged {
            current_player_id: next,
            current_player_name: next_name,
            turn_number: session.turn_number,
        },
        None,
    );
    Ok(())
}

/// Watchdog enforcing the relay turn time limit: once a turn has been held
/// longer than the limit, it is force-advanced through the same path as
/// `pass_turn`. Ends when the session is evicted or the room leaves Active.
pub fn spawn_relay_timer(state: AppState, room_id: Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tick.tick().await;
            let Some(session) = state.session(room_id).await else {
                break;
            };
            let room = match state.store.room_by_id(room_id).await {
                Ok(Some(room)) if room.status == RoomStatus::Active => room,
                _ => break,
            };
            // The relay row is read under the lock so a turn passed in the
            // meantime is not advanced a second time.
            let mut session = session.lock().await;
            let relay = match state.store.relay_state(room_id).await {
                Ok(Some(relay)) => relay,
                _ => break,
            };
            if relay.turn_time_limit <= 0 {
                continue;
            }
            let expired = now_ms() - relay.turn_started_at >= relay.turn_time_limit * 1000;
            if expired {
                info!(%room_id, player = %relay.current_player_id, "relay turn expired; advancing");
                if let Err(e) = advance_turn(&state, &mut session, &room, relay).await {
                    warn!(error = %e, %room_id, "forced turn advance failed");
                }
            }
        }
    })
}

// =============================================================================
// HINTS
// =============================================================================

/// Hint handling. `letter` reveals the solution cell through the mode's
/// normal write path (so Relay stays turn-gated and Race stays private);
/// `check` only marks and reports correctness to the requester.
pub async fn request_hint(
    state: &AppState,
    conn: &Connection,
    room_id: Uuid,
    kind: HintKind,
    x: usize,
    y: usize,
) -> Result<ServerMessage, GameError> {
    let room = load_room(state, room_id).await?;
    if room.status != RoomStatus::Active {
        return Err(GameError::NotActive);
    }
    if !room.allow_hints {
        return Err(GameError::HintsDisabled);
    }
    let player = state
        .store
        .player(room_id, conn.user_id)
        .await?
        .ok_or(GameError::RoomNotFound)?;
    if player.is_spectator {
        return Err(GameError::SpectatorEdit);
    }
    let puzzle = load_puzzle(state, &room).await?;
    if !puzzle.is_playable(x, y) {
        return Err(GameError::InvalidCell);
    }
    let owner = match room.mode {
        GameMode::Race => Some(conn.user_id),
        GameMode::Collaborative | GameMode::Relay => None,
    };

    match kind {
        HintKind::Check => {
            // Serialized with cell updates so the mark lands on the current
            // grid, not a stale copy.
            let session = state.session(room.id).await.ok_or(GameError::RoomNotFound)?;
            let _session = session.lock().await;
            let mut grid = match state.store.grid_state(room.id, owner).await? {
                Some(grid) => grid,
                None => GridState::empty(room.id, owner, puzzle.width, puzzle.height),
            };
            let correct = grid.cell(x, y).and_then(|c| c.value.as_deref()).map(|v| {
                puzzle
                    .solution(x, y)
                    .is_some_and(|s| v.eq_ignore_ascii_case(s))
            });
            if correct.is_some() {
                if let Some(cell) = grid.cell_mut(x, y) {
                    cell.correct = correct;
                }
                if let Err(e) = state.store.save_grid_state(&grid).await {
                    warn!(error = %e, room_id = %room.id, "check-hint persist failed");
                }
            }
            Ok(ServerMessage::HintResult { x, y, value: None, correct })
        }
        HintKind::Letter => {
            let letter = puzzle.solution(x, y).map(str::to_owned);
            match room.mode {
                GameMode::Collaborative => {
                    shared_write(state, conn, &room, &puzzle, &player, x, y, letter.clone(), true)
                        .await?;
                }
                GameMode::Relay => {
                    relay_gated_write(state, conn, &room, &puzzle, &player, x, y, letter.clone(), true)
                        .await?;
                }
                GameMode::Race => {
                    race_write(state, conn, &room, &puzzle, &player, x, y, letter.clone(), true)
                        .await?;
                }
            }
            Ok(ServerMessage::HintResult { x, y, value: letter, correct: Some(true) })
        }
    }
}

#[cfg(test)]
#[path = "game_test.rs"]
mod tests;
