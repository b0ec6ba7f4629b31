//! Hard run budgets: oracle calls and turns.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::core::errors::{BudgetExceededError, BudgetKind};

/// Shared oracle-call counter with a hard ceiling.
///
/// The check and the increment happen in a single atomic update, so a call
/// that would exceed the ceiling is refused before it is issued, even when
/// several plan candidates race for the last slot.
#[derive(Debug)]
pub struct CallBudget {
    ceiling: u32,
    used: AtomicU32,
}

impl CallBudget {
    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            used: AtomicU32::new(0),
        }
    }

    /// Reserve one call. Returns the 1-indexed call number on success.
    pub fn acquire(&self) -> Result<u32, BudgetExceededError> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < self.ceiling).then_some(used + 1)
            })
            .map(|previous| previous + 1)
            .map_err(|_| BudgetExceededError {
                kind: BudgetKind::OracleCalls,
                limit: self.ceiling,
            })
    }

    pub fn used(&self) -> u32 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> u32 {
        self.ceiling.saturating_sub(self.used())
    }
}

/// Return the next turn number, or an error if it would exceed `max_turns`.
pub fn next_turn(current_turn: u32, max_turns: u32) -> Result<u32, BudgetExceededError> {
    let next = current_turn.saturating_add(1);
    if next > max_turns {
        return Err(BudgetExceededError {
            kind: BudgetKind::Turns,
            limit: max_turns,
        });
    }
    Ok(next)
}
