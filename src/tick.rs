//! Monotonic change-detection clock and the periodic rebase that keeps it safe forever.

use std::sync::atomic::{AtomicU32, Ordering};

/// A point on the world's change-detection clock.
///
/// Ticks are compared by *distance*, not by raw ordering, so that the clock
/// can wrap (conceptually) without ever producing an incorrect "this changed
/// before that" answer. See [`Tick::is_newer_than`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Tick(pub u32);

impl Tick {
    pub const ZERO: Tick = Tick(0);

    /// Distance from `other` to `self`, saturating at `u32::MAX`.
    pub fn relative_to(self, other: Tick) -> u32 {
        self.0.wrapping_sub(other.0)
    }

    /// True if `self` represents a point strictly after `other`, within the
    /// half-range window that the maintenance pass guarantees never overflows.
    pub fn is_newer_than(self, other: Tick, relative_to_current: Tick) -> bool {
        let ticks_since_insert = relative_to_current.relative_to(self);
        let ticks_since_change = relative_to_current.relative_to(other);
        ticks_since_insert <= ticks_since_change
    }
}

/// Default distance from the current tick that triggers a maintenance rebase.
/// Kept comfortably under `u32::MAX / 2` so that no legitimate age comparison
/// is ever ambiguous between a rebase pass and the next.
pub const DEFAULT_MAINTENANCE_THRESHOLD: u32 = u32::MAX / 2 - 16;

/// The world's monotonic clock plus the bookkeeping needed to rebase every
/// stored tick when any of them would otherwise drift more than half the
/// `u32` range away from the current tick.
#[derive(Debug)]
pub struct ChangeTickEngine {
    current: AtomicU32,
    maintenance_threshold: u32,
}

impl ChangeTickEngine {
    pub fn new(maintenance_threshold: u32) -> Self {
        Self {
            current: AtomicU32::new(1),
            maintenance_threshold,
        }
    }

    /// Current world tick.
    pub fn current(&self) -> Tick {
        Tick(self.current.load(Ordering::Relaxed))
    }

    /// Advance the clock by one and return the new tick. Called once per
    /// schedule run (conceptually, once per frame).
    pub fn advance(&self) -> Tick {
        Tick(self.current.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn maintenance_threshold(&self) -> u32 {
        self.maintenance_threshold
    }

    /// Returns `true` if `stored` has drifted far enough from `current` that
    /// a maintenance pass should run before trusting age comparisons against it.
    pub fn needs_maintenance(&self, stored: Tick) -> bool {
        self.current().relative_to(stored) > self.maintenance_threshold
    }

    /// Rebase a single stored tick: clamp it so its distance from `current`
    /// never exceeds the maintenance threshold. Ticks inside the live window
    /// are left untouched; only ticks that would otherwise be treated as
    /// "infinitely old" are folded into the ancient class at the threshold.
    pub fn rebase(&self, stored: Tick) -> Tick {
        let current = self.current();
        if current.relative_to(stored) > self.maintenance_threshold {
            Tick(current.0.wrapping_sub(self.maintenance_threshold))
        } else {
            stored
        }
    }
}

impl Default for ChangeTickEngine {
    fn default() -> Self {
        Self::new(DEFAULT_MAINTENANCE_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_increments_monotonically() {
        let engine = ChangeTickEngine::default();
        let t0 = engine.current();
        let t1 = engine.advance();
        assert!(t1.relative_to(t0) == 1);
    }

    #[test]
    fn rebase_is_identity_within_window() {
        let engine = ChangeTickEngine::new(1000);
        let stored = engine.current();
        engine.advance();
        assert_eq!(engine.rebase(stored), stored);
    }

    #[test]
    fn rebase_clamps_ancient_ticks() {
        let engine = ChangeTickEngine::new(100);
        let stored = Tick(0);
        // Push current far enough away that `stored` needs maintenance.
        for _ in 0..200 {
            engine.advance();
        }
        assert!(engine.needs_maintenance(stored));
        let rebased = engine.rebase(stored);
        assert_eq!(engine.current().relative_to(rebased), 100);
    }

    #[test]
    fn is_newer_than_respects_relative_window() {
        let current = Tick(50);
        let older = Tick(10);
        let newer = Tick(40);
        assert!(newer.is_newer_than(older, current));
        assert!(!older.is_newer_than(newer, current));
    }
}
