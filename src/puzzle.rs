//! Puzzle types and the catalog collaborator.
//!
//! DESIGN
//! ======
//! The hub never generates puzzles — a `PuzzleCatalog` resolves a puzzle id
//! to its grid, solution letters, and clues. Solution letters must never be
//! bulk-transmitted: `Puzzle::sanitized` is the only shape that may be sent
//! to clients, and it carries just the playable-cell mask plus clue metadata
//! (number, text, position, length, direction). Letters are only revealed
//! cell-by-cell through the hint path.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::GridState;
use crate::store::StoreError;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Across,
    Down,
}

/// Full clue, solution attached. Server-side only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clue {
    pub id: String,
    pub number: u32,
    pub direction: Direction,
    /// Zero-based start cell.
    pub row: usize,
    pub col: usize,
    pub length: usize,
    pub text: String,
    pub answer: String,
}

impl Clue {
    /// Cells this clue covers, as (x, y) pairs.
    #[must_use]
    pub fn cells(&self) -> Vec<(usize, usize)> {
        (0..self.length)
            .map(|i| match self.direction {
                Direction::Across => (self.col + i, self.row),
                Direction::Down => (self.col, self.row + i),
            })
            .collect()
    }
}

/// Full puzzle, solution attached. Server-side only; see [`Puzzle::sanitized`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Puzzle {
    pub id: Uuid,
    pub title: String,
    pub width: usize,
    pub height: usize,
    /// Row-major solution letters; `None` marks a black square.
    pub grid: Vec<Vec<Option<String>>>,
    pub clues: Vec<Clue>,
}

impl Puzzle {
    #[must_use]
    pub fn is_playable(&self, x: usize, y: usize) -> bool {
        self.solution(x, y).is_some()
    }

    #[must_use]
    pub fn solution(&self, x: usize, y: usize) -> Option<&str> {
        self.grid
            .get(y)
            .and_then(|row| row.get(x))
            .and_then(|cell| cell.as_deref())
    }

    /// Number of fillable (non-black) cells.
    #[must_use]
    pub fn playable_count(&self) -> usize {
        self.grid
            .iter()
            .flatten()
            .filter(|cell| cell.is_some())
            .count()
    }

    /// Does `grid` hold the correct letter for every playable cell?
    #[must_use]
    pub fn is_solved_by(&self, grid: &GridState) -> bool {
        for y in 0..self.height {
            for x in 0..self.width {
                let Some(answer) = self.solution(x, y) else {
                    continue;
                };
                let filled = grid.cell(x, y).and_then(|c| c.value.as_deref());
                if !filled.is_some_and(|v| v.eq_ignore_ascii_case(answer)) {
                    return false;
                }
            }
        }
        true
    }

    /// Fraction of playable cells correctly filled, as 0..=100.
    #[must_use]
    pub fn percent_correct(&self, grid: &GridState) -> u32 {
        let total = self.playable_count();
        if total == 0 {
            return 100;
        }
        let mut matching = 0usize;
        for y in 0..self.height {
            for x in 0..self.width {
                let Some(answer) = self.solution(x, y) else {
                    continue;
                };
                let filled = grid.cell(x, y).and_then(|c| c.value.as_deref());
                if filled.is_some_and(|v| v.eq_ignore_ascii_case(answer)) {
                    matching += 1;
                }
            }
        }
        u32::try_from(matching * 100 / total).unwrap_or(0)
    }

    /// Clues whose span includes (x, y).
    pub fn clues_at(&self, x: usize, y: usize) -> impl Iterator<Item = &Clue> {
        self.clues
            .iter()
            .filter(move |clue| clue.cells().contains(&(x, y)))
    }

    /// Is every cell of `clue` correctly filled in `grid`?
    #[must_use]
    pub fn clue_solved(&self, clue: &Clue, grid: &GridState) -> bool {
        clue.cells().iter().all(|&(x, y)| {
            let Some(answer) = self.solution(x, y) else {
                return false;
            };
            grid.cell(x, y)
                .and_then(|c| c.value.as_deref())
                .is_some_and(|v| v.eq_ignore_ascii_case(answer))
        })
    }

    /// Client-safe copy: solution letters stripped everywhere.
    #[must_use]
    pub fn sanitized(&self) -> SanitizedPuzzle {
        SanitizedPuzzle {
            id: self.id,
            title: self.title.clone(),
            width: self.width,
            height: self.height,
            playable: self
                .grid
                .iter()
                .map(|row| row.iter().map(Option::is_some).collect())
                .collect(),
            clues: self
                .clues
                .iter()
                .map(|c| SanitizedClue {
                    id: c.id.clone(),
                    number: c.number,
                    direction: c.direction,
                    row: c.row,
                    col: c.col,
                    length: c.length,
                    text: c.text.clone(),
                })
                .collect(),
        }
    }
}

/// What clients receive: playable mask and answer-free clues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedPuzzle {
    pub id: Uuid,
    pub title: String,
    pub width: usize,
    pub height: usize,
    pub playable: Vec<Vec<bool>>,
    pub clues: Vec<SanitizedClue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedClue {
    pub id: String,
    pub number: u32,
    pub direction: Direction,
    pub row: usize,
    pub col: usize,
    pub length: usize,
    pub text: String,
}

// =============================================================================
// CATALOG
// =============================================================================

/// Resolves a puzzle id to its full (solution-bearing) puzzle.
#[async_trait]
pub trait PuzzleCatalog: Send + Sync {
    async fn puzzle(&self, id: Uuid) -> Result<Option<Puzzle>, StoreError>;
}

/// In-memory catalog for tests and database-less dev runs.
pub struct MemoryCatalog {
    puzzles: RwLock<HashMap<Uuid, Puzzle>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self { puzzles: RwLock::new(HashMap::new()) }
    }

    /// Catalog pre-seeded with the built-in demo puzzle.
    #[must_use]
    pub fn with_demo() -> (Self, Uuid) {
        let puzzle = demo_puzzle();
        let id = puzzle.id;
        let mut map = HashMap::new();
        map.insert(id, puzzle);
        (Self { puzzles: RwLock::new(map) }, id)
    }

    pub async fn insert(&self, puzzle: Puzzle) {
        self.puzzles.write().await.insert(puzzle.id, puzzle);
    }
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PuzzleCatalog for MemoryCatalog {
    async fn puzzle(&self, id: Uuid) -> Result<Option<Puzzle>, StoreError> {
        Ok(self.puzzles.read().await.get(&id).cloned())
    }
}

// =============================================================================
// DEMO PUZZLE
// =============================================================================

/// Built-in 5×5 word square (the Sator square), used when no database is
/// configured and throughout the tests.
#[must_use]
pub fn demo_puzzle() -> Puzzle {
    let rows = ["SATOR", "AREPO", "TENET", "OPERA", "ROTAS"];
    let grid = rows
        .iter()
        .map(|row| row.chars().map(|ch| Some(ch.to_string())).collect())
        .collect();

    let mut clues = Vec::new();
    // Full 5x5 grid: across entries number 1, 6, 7, 8, 9; downs 1..=5.
    let across_numbers = [1u32, 6, 7, 8, 9];
    for (row, (word, number)) in rows.iter().zip(across_numbers).enumerate() {
        clues.push(Clue {
            id: format!("{number}-across"),
            number,
            direction: Direction::Across,
            row,
            col: 0,
            length: 5,
            text: format!("Row word {}", row + 1),
            answer: (*word).to_string(),
        });
    }
    for col in 0..5 {
        let answer: String = rows.iter().filter_map(|r| r.chars().nth(col)).collect();
        let number = u32::try_from(col + 1).unwrap_or(1);
        clues.push(Clue {
            id: format!("{number}-down"),
            number,
            direction: Direction::Down,
            row: 0,
            col,
            length: 5,
            text: format!("Column word {}", col + 1),
            answer,
        });
    }

    Puzzle {
        id: Uuid::new_v4(),
        title: "Sator Square".into(),
        width: 5,
        height: 5,
        grid,
        clues,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GridState;

    fn filled_grid(puzzle: &Puzzle) -> GridState {
        let mut grid = GridState::empty(Uuid::new_v4(), None, puzzle.width, puzzle.height);
        for y in 0..puzzle.height {
            for x in 0..puzzle.width {
                if let Some(answer) = puzzle.solution(x, y) {
                    if let Some(cell) = grid.cell_mut(x, y) {
                        cell.value = Some(answer.to_lowercase());
                    }
                }
            }
        }
        grid
    }

    #[test]
    fn demo_puzzle_is_consistent() {
        let puzzle = demo_puzzle();
        assert_eq!(puzzle.playable_count(), 25);
        assert_eq!(puzzle.clues.len(), 10);
        for clue in &puzzle.clues {
            let letters: String = clue
                .cells()
                .iter()
                .filter_map(|&(x, y)| puzzle.solution(x, y))
                .collect();
            assert_eq!(letters, clue.answer, "clue {} disagrees with grid", clue.id);
        }
    }

    #[test]
    fn solved_detection_is_case_insensitive() {
        let puzzle = demo_puzzle();
        let grid = filled_grid(&puzzle);
        assert!(puzzle.is_solved_by(&grid));
        assert_eq!(puzzle.percent_correct(&grid), 100);
    }

    #[test]
    fn partial_fill_reports_partial_percent() {
        let puzzle = demo_puzzle();
        let mut grid = filled_grid(&puzzle);
        if let Some(cell) = grid.cell_mut(0, 0) {
            cell.value = Some("X".into());
        }
        assert!(!puzzle.is_solved_by(&grid));
        assert_eq!(puzzle.percent_correct(&grid), 96);
    }

    #[test]
    fn empty_grid_is_not_solved() {
        let puzzle = demo_puzzle();
        let grid = GridState::empty(Uuid::new_v4(), None, puzzle.width, puzzle.height);
        assert!(!puzzle.is_solved_by(&grid));
        assert_eq!(puzzle.percent_correct(&grid), 0);
    }

    #[test]
    fn clue_solved_tracks_its_span_only() {
        let puzzle = demo_puzzle();
        let mut grid = GridState::empty(Uuid::new_v4(), None, puzzle.width, puzzle.height);
        let clue = puzzle
            .clues
            .iter()
            .find(|c| c.id == "1-across")
            .expect("demo has 1-across");
        for (i, &(x, y)) in clue.cells().iter().enumerate() {
            assert!(!puzzle.clue_solved(clue, &grid), "solved after {i} letters");
            if let Some(cell) = grid.cell_mut(x, y) {
                cell.value = puzzle.solution(x, y).map(str::to_string);
            }
        }
        assert!(puzzle.clue_solved(clue, &grid));
    }

    #[test]
    fn sanitized_strips_all_solution_letters() {
        let puzzle = demo_puzzle();
        let sanitized = puzzle.sanitized();
        assert_eq!(sanitized.clues.len(), puzzle.clues.len());
        assert!(sanitized.playable.iter().flatten().all(|p| *p));

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("answer"));
        assert!(!json.contains("SATOR"));
        assert!(!json.contains("TENET"));
    }

    #[test]
    fn clues_at_finds_crossing_entries() {
        let puzzle = demo_puzzle();
        let ids: Vec<&str> = puzzle.clues_at(2, 2).map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"7-across"));
        assert!(ids.contains(&"3-down"));
    }
}
