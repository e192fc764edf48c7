//! Fatal reporting for internal invariant violations.
//!
//! Hot-path structures (arena, lists, stacks, exchange buffers) do not
//! return error codes for broken invariants. They call [`fatal`], which
//! emits a `tracing` error event with the full diagnostic context and then
//! panics. The panic unwinds the worker thread; the engine treats it as a
//! bug, never as a recoverable condition.
//!
//! Rank and worker context is attached implicitly: the engine opens a
//! [`DiagnosticScope`] on every thread it owns, and [`Site::here`] reads it.

use std::cell::Cell;
use std::fmt;

use crate::id::{Offset, RankId, WorkerId};

thread_local! {
    static SCOPE: Cell<(Option<RankId>, Option<WorkerId>)> = const { Cell::new((None, None)) };
}

/// Location of a fatal invariant violation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Site {
    /// Rank that detected the violation.
    pub rank: Option<RankId>,
    /// Worker thread that detected the violation.
    pub worker: Option<WorkerId>,
    /// Structure being operated on (`"arena"`, `"list"`, `"dd-send"`, ...).
    pub structure: &'static str,
    /// Arena offset involved, if any.
    pub offset: Option<Offset>,
}

impl Site {
    /// A site for `structure`, carrying the calling thread's diagnostic scope.
    pub fn here(structure: &'static str) -> Self {
        let (rank, worker) = SCOPE.with(|s| s.get());
        Self {
            rank,
            worker,
            structure,
            offset: None,
        }
    }

    /// Attach the arena offset involved in the violation.
    pub fn at(mut self, offset: Offset) -> Self {
        self.offset = Some(offset);
        self
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.structure)?;
        if let Some(rank) = self.rank {
            write!(f, " rank={rank}")?;
        }
        if let Some(worker) = self.worker {
            write!(f, " worker={worker}")?;
        }
        if let Some(offset) = self.offset {
            write!(f, " offset={offset}")?;
        }
        Ok(())
    }
}

/// Report an internal invariant violation and abort the current thread.
#[cold]
#[track_caller]
pub fn fatal(site: Site, detail: fmt::Arguments<'_>) -> ! {
    tracing::error!(
        rank = ?site.rank,
        worker = ?site.worker,
        structure = site.structure,
        offset = ?site.offset,
        "internal error: {detail}"
    );
    panic!("ember internal error [{site}]: {detail}");
}

/// Shorthand for [`fatal`] with `format!`-style arguments.
///
/// ```should_panic
/// use ember_core::{fatal, Site};
/// fatal!(Site::here("example").at(7), "offset {} out of range", 7);
/// ```
#[macro_export]
macro_rules! fatal {
    ($site:expr, $($arg:tt)+) => {
        $crate::fatal::fatal($site, format_args!($($arg)+))
    };
}

/// Tags every [`Site::here`] created on this thread with a rank and worker.
///
/// The previous scope is restored on drop, so scopes nest.
#[must_use = "the scope is cleared when the guard is dropped"]
pub struct DiagnosticScope {
    previous: (Option<RankId>, Option<WorkerId>),
}

impl DiagnosticScope {
    /// Enter a scope for `rank`, optionally narrowed to one worker.
    pub fn enter(rank: RankId, worker: Option<WorkerId>) -> Self {
        let previous = SCOPE.with(|s| s.replace((Some(rank), worker)));
        Self { previous }
    }
}

impl Drop for DiagnosticScope {
    fn drop(&mut self) {
        SCOPE.with(|s| s.set(self.previous));
    }
}
