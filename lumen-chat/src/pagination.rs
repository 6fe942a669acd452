//! Per-room cursor state.
//!
//! ```text
//!             begin_initial            complete(Some(c))
//! Unstarted ───────────────► fetching ─────────────────► More(c) ──┐
//!     ▲                         │                           ▲      │ begin_next
//!     │            fail()       │   complete(None)          │      ▼
//!     └─────────────────────────┤ ─────────────────► Exhausted   fetching
//!                               │                                  │
//!                               └─ phase unchanged ◄── fail() ─────┘
//! ```
//!
//! Only one request may be outstanding. A begin while fetching is refused,
//! never queued.

use lumen_core::Cursor;

/// Where a room's backfill stands.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PaginationPhase {
    /// No page has been loaded yet.
    Unstarted,
    /// Older messages remain behind this cursor.
    More(Cursor),
    /// The server reported no further pages.
    Exhausted,
}

/// Why a fetch could not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refusal {
    /// Another page request is outstanding.
    InFlight,
    /// No cursor to continue from.
    NoCursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaginationState {
    phase: PaginationPhase,
    is_fetching: bool,
}

impl Default for PaginationState {
    fn default() -> Self {
        Self::new()
    }
}

impl PaginationState {
    pub fn new() -> Self {
        Self {
            phase: PaginationPhase::Unstarted,
            is_fetching: false,
        }
    }

    pub fn is_fetching(&self) -> bool {
        self.is_fetching
    }

    pub fn next_cursor(&self) -> Option<&Cursor> {
        match &self.phase {
            PaginationPhase::More(cursor) => Some(cursor),
            _ => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.phase == PaginationPhase::Exhausted
    }

    /// Start a newest-page request. Allowed in any phase (acts as a refresh).
    pub fn begin_initial(&mut self) -> Result<(), Refusal> {
        if self.is_fetching {
            return Err(Refusal::InFlight);
        }
        self.is_fetching = true;
        Ok(())
    }

    /// Start a request for the page behind the stored cursor.
    pub fn begin_next(&mut self) -> Result<Cursor, Refusal> {
        if self.is_fetching {
            return Err(Refusal::InFlight);
        }
        let cursor = self.next_cursor().cloned().ok_or(Refusal::NoCursor)?;
        self.is_fetching = true;
        Ok(cursor)
    }

    /// Record a successful page and the cursor it returned.
    pub fn complete(&mut self, next_cursor: Option<Cursor>) {
        self.is_fetching = false;
        self.phase = match next_cursor {
            Some(cursor) => PaginationPhase::More(cursor),
            None => PaginationPhase::Exhausted,
        };
    }

    /// Record a failed request. The phase is left as it was.
    pub fn fail(&mut self) {
        self.is_fetching = false;
    }
}
