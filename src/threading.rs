//! Host-runtime lock bracketing around long kernel runs.
//!
//! The engine itself spawns no threads. What it offers is a seam for
//! embedders whose runtime serializes access to managed state: before a
//! kernel run large enough to be worth it, the bracket's lock is released
//! so other host threads can make progress, and it is reacquired when the
//! run finishes or fails. Runs touching object elements keep the lock held
//! for their whole duration.

use crate::array::Array;
use crate::MIN_THREAD_LENGTH;

/// A releasable host lock, in the style of an interpreter's global lock.
pub trait ThreadBracket {
    fn release(&self);
    fn reacquire(&self);
}

/// Holds a released bracket; reacquires on drop, so early returns and
/// kernel errors restore the lock.
pub(crate) struct BracketGuard<'a> {
    bracket: Option<&'a dyn ThreadBracket>,
}

impl Drop for BracketGuard<'_> {
    fn drop(&mut self) {
        if let Some(b) = self.bracket {
            b.reacquire();
        }
    }
}

/// Release the bracket when the run is long enough to amortize the two
/// lock transitions and no operand needs the lock held.
pub(crate) fn maybe_release<'a>(
    bracket: Option<&'a dyn ThreadBracket>,
    total_len: usize,
    operands: &[&Array],
) -> BracketGuard<'a> {
    let eligible = total_len >= MIN_THREAD_LENGTH
        && !operands.iter().any(|a| a.dtype().needs_exclusive_runtime());
    match (bracket, eligible) {
        (Some(b), true) => {
            b.release();
            BracketGuard { bracket: Some(b) }
        }
        _ => BracketGuard { bracket: None },
    }
}
