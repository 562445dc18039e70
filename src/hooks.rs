//! Caller-supplied interception points.
//!
//! An [`OverrideHook`] sees every entry point before the engine does any
//! work and may take over the whole call. [`OutputHook`]s see output arrays
//! twice: `prepare` just before the kernel writes them and `wrap` after the
//! call completes. When several operands carry output hooks, the one with
//! the highest priority wins, first one encountered on a tie.

use crate::array::Array;
use crate::ufunc::{UFunc, UFuncMethod};
use crate::Result;

/// Full-call interception, checked once at the top of every entry point.
pub trait OverrideHook {
    /// Return `Some` to replace the result of the whole call, `None` to let
    /// the engine proceed normally.
    fn try_override(
        &self,
        ufunc: &UFunc,
        method: UFuncMethod,
        inputs: &[Array],
    ) -> Option<Result<Vec<Array>>>;
}

/// Output-array interception.
pub trait OutputHook {
    /// Ordering among competing hooks. Higher wins.
    fn priority(&self) -> f64 {
        0.0
    }

    /// Called with each output before any kernel writes to it. The returned
    /// array replaces the output for the rest of the call; it must keep the
    /// output's shape and dtype.
    fn prepare(&self, ufunc: &UFunc, out: Array, index: usize) -> Result<Array> {
        let _ = (ufunc, index);
        Ok(out)
    }

    /// Called with each output after the call completes. Skipped when the
    /// caller passed `subok = false`.
    fn wrap(&self, ufunc: &UFunc, out: Array, index: usize) -> Result<Array> {
        let _ = (ufunc, index);
        Ok(out)
    }
}

/// Pick the hook with the highest priority. Ties keep the earliest.
pub fn select_output_hook<'a>(hooks: &[&'a dyn OutputHook]) -> Option<&'a dyn OutputHook> {
    let mut best: Option<&'a dyn OutputHook> = None;
    for &hook in hooks {
        match best {
            Some(cur) if hook.priority() <= cur.priority() => {}
            _ => best = Some(hook),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagged(f64);

    impl OutputHook for Tagged {
        fn priority(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_highest_priority_wins() {
        let a = Tagged(0.0);
        let b = Tagged(2.0);
        let c = Tagged(1.0);
        let picked = select_output_hook(&[&a, &b, &c]).unwrap();
        assert_eq!(picked.priority(), 2.0);
    }

    #[test]
    fn test_tie_keeps_first() {
        let a = Tagged(1.0);
        let b = Tagged(1.0);
        let picked = select_output_hook(&[&a, &b]).unwrap();
        assert!(std::ptr::eq(
            picked as *const dyn OutputHook as *const u8,
            &a as &dyn OutputHook as *const dyn OutputHook as *const u8,
        ));
    }

    #[test]
    fn test_empty_list() {
        assert!(select_output_hook(&[]).is_none());
    }
}
