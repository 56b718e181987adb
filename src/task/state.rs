//! Task lifecycle stage and its atomic cell.
//!
//! A task's stage only ever moves forward:
//!
//! ```text
//! New → Active → Completing → Completed
//!   \        \       ↓
//!    \        → Cancelling → Cancelled
//!     → Cancelling / Cancelled
//! ```
//!
//! `Completing` and `Cancelling` are transient: the body has finished (or
//! been told to stop) but children have not all reached a terminal state yet.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// The lifecycle stage of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Stage {
    /// Created but not started. Only lazily-started tasks rest here.
    New = 0,
    /// The body is scheduled or running.
    Active = 1,
    /// The body finished; waiting for children to drain.
    Completing = 2,
    /// Cancellation accepted; waiting for children to drain.
    Cancelling = 3,
    /// Terminal: finished with a value, failure, or panic.
    Completed = 4,
    /// Terminal: finished by cancellation.
    Cancelled = 5,
}

impl Stage {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Completing,
            3 => Self::Cancelling,
            4 => Self::Completed,
            5 => Self::Cancelled,
            _ => unreachable!("invalid stage encoding: {raw}"),
        }
    }

    /// Returns true if this stage is terminal.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Returns true if cancellation has been accepted or completed.
    #[must_use]
    pub const fn is_cancelling(self) -> bool {
        matches!(self, Self::Cancelling | Self::Cancelled)
    }

    /// Returns true if `self → next` is a legal forward transition.
    pub(crate) const fn can_advance_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Active)
                | (Self::New, Self::Cancelling)
                | (Self::New, Self::Cancelled)
                | (Self::Active, Self::Completing)
                | (Self::Active, Self::Cancelling)
                | (Self::Completing, Self::Cancelling)
                | (Self::Completing, Self::Completed)
                | (Self::Cancelling, Self::Cancelled)
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Active => write!(f, "active"),
            Self::Completing => write!(f, "completing"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// The atomic stage word of one task.
///
/// All mutation goes through [`try_advance`](Self::try_advance): a single
/// compare-and-set of a legal forward transition. No lock is ever held while
/// transitioning, so no task blocks another's thread to move its own state.
#[derive(Debug)]
pub(crate) struct StageCell(AtomicU8);

impl StageCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Stage::New as u8))
    }

    pub(crate) fn load(&self) -> Stage {
        Stage::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Attempts the transition `from → to`. Returns false when the stage has
    /// already moved on.
    ///
    /// Requesting an illegal transition is a consistency violation.
    pub(crate) fn try_advance(&self, from: Stage, to: Stage) -> bool {
        debug_assert!(
            from.can_advance_to(to),
            "illegal stage transition {from} -> {to}"
        );
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let legal = [
            (Stage::New, Stage::Active),
            (Stage::New, Stage::Cancelling),
            (Stage::New, Stage::Cancelled),
            (Stage::Active, Stage::Completing),
            (Stage::Active, Stage::Cancelling),
            (Stage::Completing, Stage::Cancelling),
            (Stage::Completing, Stage::Completed),
            (Stage::Cancelling, Stage::Cancelled),
        ];
        for (from, to) in legal {
            assert!(from.can_advance_to(to), "{from} -> {to} should be legal");
            assert!((from as u8) < (to as u8), "{from} -> {to} moves forward");
        }
        // No path leads backwards or out of a terminal stage.
        for from in [Stage::Completed, Stage::Cancelled] {
            for to in [
                Stage::New,
                Stage::Active,
                Stage::Completing,
                Stage::Cancelling,
                Stage::Completed,
                Stage::Cancelled,
            ] {
                assert!(!from.can_advance_to(to));
            }
        }
        assert!(!Stage::Active.can_advance_to(Stage::New));
        assert!(!Stage::Completing.can_advance_to(Stage::Active));
    }

    #[test]
    fn cell_cas_moves_once() {
        let cell = StageCell::new();
        assert_eq!(cell.load(), Stage::New);
        assert!(cell.try_advance(Stage::New, Stage::Active));
        assert_eq!(cell.load(), Stage::Active);
        // The stage moved on; a stale transition attempt fails.
        assert!(!cell.try_advance(Stage::New, Stage::Active));
        assert!(cell.try_advance(Stage::Active, Stage::Completing));
        assert!(cell.try_advance(Stage::Completing, Stage::Completed));
        assert_eq!(cell.load(), Stage::Completed);
        assert!(cell.load().is_terminal());
    }

    #[test]
    fn terminal_predicates() {
        assert!(Stage::Completed.is_terminal());
        assert!(Stage::Cancelled.is_terminal());
        assert!(!Stage::Completing.is_terminal());
        assert!(Stage::Cancelling.is_cancelling());
        assert!(Stage::Cancelled.is_cancelling());
        assert!(!Stage::Completing.is_cancelling());
    }
}
