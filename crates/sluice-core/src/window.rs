// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded atomic flow-control counter.
//!
//! A [`WindowSizeCounter`] packs a count and an explicit suspend flag into a
//! single machine word. The top bit is the suspend flag, the remaining bits
//! hold the count:
//!
//! ```text
//!  63                                                             0
//! ┌───┬─────────────────────────────────────────────────────────────┐
//! │ S │                         count                               │
//! └───┴─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every read-modify-write returns a [`WindowUpdate`] derived from the same
//! atomic operation, so callers can decide whether the update suspended or
//! resumed the counter without a separate (racy) read.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

const COUNTER_MASK: usize = usize::MAX >> 1;
const SUSPEND_MASK: usize = !COUNTER_MASK;

/// Largest count a [`WindowSizeCounter`] can hold.
pub const COUNTER_MAX: usize = COUNTER_MASK;

/// Suspension state observed by a single atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Count before the update (suspend flag stripped).
    pub previous: usize,
    /// Whether the counter was suspended before the update.
    pub was_suspended: bool,
    /// Whether the counter is suspended after the update.
    pub suspended: bool,
}

impl WindowUpdate {
    /// The update moved the counter out of the suspended state.
    pub fn resumed(&self) -> bool {
        self.was_suspended && !self.suspended
    }

    /// The update moved the counter into the suspended state.
    pub fn became_suspended(&self) -> bool {
        !self.was_suspended && self.suspended
    }
}

/// Lock-free bounded counter with a suspend bit.
///
/// The counter is suspended when the explicit suspend bit is set, or when the
/// count reaches `suspend_threshold` (a threshold of zero disables the
/// count-based suspension).
pub struct WindowSizeCounter {
    value: AtomicUsize,
    suspend_threshold: usize,
}

impl WindowSizeCounter {
    /// Create a counter at zero with the given suspend threshold.
    pub fn new(suspend_threshold: usize) -> Self {
        Self {
            value: AtomicUsize::new(0),
            suspend_threshold: suspend_threshold & COUNTER_MASK,
        }
    }

    /// Largest representable count.
    pub fn max() -> usize {
        COUNTER_MAX
    }

    /// Threshold at which the count alone suspends the counter.
    pub fn suspend_threshold(&self) -> usize {
        self.suspend_threshold
    }

    /// Overwrite the count, clearing the suspend bit.
    ///
    /// Not ordered against concurrent `add`/`sub`: the last write wins.
    pub fn set(&self, value: usize) {
        self.value.store(value & COUNTER_MASK, Ordering::Relaxed);
    }

    /// Current count and suspension state from one atomic read.
    pub fn get(&self) -> (usize, bool) {
        let v = self.value.load(Ordering::Acquire);
        (v & COUNTER_MASK, self.is_suspended_word(v))
    }

    /// Current count.
    pub fn value(&self) -> usize {
        self.get().0
    }

    /// Whether consumption should pause.
    pub fn suspended(&self) -> bool {
        self.get().1
    }

    /// Whether the explicit suspend bit is set, regardless of the count.
    pub fn explicitly_suspended(&self) -> bool {
        self.value.load(Ordering::Acquire) & SUSPEND_MASK != 0
    }

    /// Add `value`, returning the previous count.
    ///
    /// # Panics
    ///
    /// Panics if the result would exceed [`COUNTER_MAX`].
    pub fn add(&self, value: usize) -> usize {
        self.fetch_add(value).previous
    }

    /// Subtract `value`, returning the previous count.
    ///
    /// # Panics
    ///
    /// Panics if `value` is larger than the current count.
    pub fn sub(&self, value: usize) -> usize {
        self.fetch_sub(value).previous
    }

    /// Add `value` and report the suspension transition of this update.
    pub fn fetch_add(&self, value: usize) -> WindowUpdate {
        let prev = self.value.fetch_add(value, Ordering::AcqRel);
        let old = prev & COUNTER_MASK;
        assert!(
            value <= COUNTER_MAX - old,
            "window counter overflow: {} + {} exceeds {}",
            old,
            value,
            COUNTER_MAX
        );
        self.update(prev, prev.wrapping_add(value))
    }

    /// Subtract `value` and report the suspension transition of this update.
    pub fn fetch_sub(&self, value: usize) -> WindowUpdate {
        let prev = self.value.fetch_sub(value, Ordering::AcqRel);
        let old = prev & COUNTER_MASK;
        assert!(
            old >= value,
            "window counter underflow: {} - {} is negative",
            old,
            value
        );
        self.update(prev, prev.wrapping_sub(value))
    }

    /// Set the suspend bit without touching the count. Idempotent.
    pub fn suspend(&self) -> WindowUpdate {
        let prev = self.value.fetch_or(SUSPEND_MASK, Ordering::AcqRel);
        self.update(prev, prev | SUSPEND_MASK)
    }

    /// Clear the suspend bit without touching the count. Idempotent.
    ///
    /// The counter stays suspended if the count is still at or above the
    /// threshold.
    pub fn resume(&self) -> WindowUpdate {
        let prev = self.value.fetch_and(COUNTER_MASK, Ordering::AcqRel);
        self.update(prev, prev & COUNTER_MASK)
    }

    fn update(&self, prev: usize, next: usize) -> WindowUpdate {
        WindowUpdate {
            previous: prev & COUNTER_MASK,
            was_suspended: self.is_suspended_word(prev),
            suspended: self.is_suspended_word(next),
        }
    }

    fn is_suspended_word(&self, word: usize) -> bool {
        if word & SUSPEND_MASK != 0 {
            return true;
        }
        self.suspend_threshold > 0 && word >= self.suspend_threshold
    }
}

impl fmt::Debug for WindowSizeCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (value, suspended) = self.get();
        f.debug_struct("WindowSizeCounter")
            .field("value", &value)
            .field("suspended", &suspended)
            .field("suspend_threshold", &self.suspend_threshold)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_sub_returns_previous() {
        let counter = WindowSizeCounter::new(0);

        assert_eq!(counter.add(5), 0);
        assert_eq!(counter.add(3), 5);
        assert_eq!(counter.sub(2), 8);
        assert_eq!(counter.get(), (6, false));
    }

    #[test]
    fn test_zero_threshold_never_suspends_on_count() {
        let counter = WindowSizeCounter::new(0);
        counter.add(1_000_000);
        assert!(!counter.suspended());

        counter.sub(1_000_000);
        assert_eq!(counter.get(), (0, false));
    }

    #[test]
    fn test_threshold_suspends_and_resumes() {
        let counter = WindowSizeCounter::new(3);

        let update = counter.fetch_add(2);
        assert!(!update.suspended);

        let update = counter.fetch_add(1);
        assert!(update.became_suspended());
        assert_eq!(counter.get(), (3, true));

        let update = counter.fetch_sub(1);
        assert!(update.resumed());
        assert_eq!(counter.get(), (2, false));
    }

    #[test]
    fn test_explicit_suspend_holds_regardless_of_count() {
        let counter = WindowSizeCounter::new(10);
        counter.add(1);

        let update = counter.suspend();
        assert!(update.became_suspended());
        assert_eq!(counter.get(), (1, true));

        // Dropping the count does not clear the explicit flag
        let update = counter.fetch_sub(1);
        assert!(update.was_suspended);
        assert!(update.suspended);

        let update = counter.resume();
        assert!(update.resumed());
        assert_eq!(counter.get(), (0, false));
    }

    #[test]
    fn test_suspend_and_resume_are_idempotent() {
        let counter = WindowSizeCounter::new(0);

        counter.suspend();
        let again = counter.suspend();
        assert!(again.was_suspended && again.suspended);
        assert!(counter.explicitly_suspended());

        counter.resume();
        let again = counter.resume();
        assert!(!again.was_suspended && !again.suspended);
        assert!(!counter.explicitly_suspended());
    }

    #[test]
    fn test_resume_keeps_threshold_suspension() {
        let counter = WindowSizeCounter::new(2);
        counter.add(2);
        counter.suspend();

        let update = counter.resume();
        assert!(!update.resumed());
        assert!(counter.suspended());
        assert!(!counter.explicitly_suspended());
    }

    #[test]
    fn test_set_masks_value_and_clears_suspend() {
        let counter = WindowSizeCounter::new(0);
        counter.suspend();
        counter.set(usize::MAX);

        assert_eq!(counter.get(), (COUNTER_MAX, false));
    }

    #[test]
    fn test_count_arithmetic_survives_suspend_bit() {
        let counter = WindowSizeCounter::new(0);
        counter.suspend();
        counter.add(7);
        counter.sub(4);

        assert_eq!(counter.get(), (3, true));
    }

    #[test]
    fn test_max_value_is_addressable() {
        let counter = WindowSizeCounter::new(0);
        counter.add(COUNTER_MAX);
        assert_eq!(counter.value(), COUNTER_MAX);
        assert_eq!(WindowSizeCounter::max(), COUNTER_MAX);
    }

    #[test]
    #[should_panic(expected = "window counter underflow")]
    fn test_sub_below_zero_panics() {
        let counter = WindowSizeCounter::new(0);
        counter.add(1);
        counter.sub(2);
    }

    #[test]
    #[should_panic(expected = "window counter overflow")]
    fn test_add_past_max_panics() {
        let counter = WindowSizeCounter::new(0);
        counter.add(COUNTER_MAX);
        counter.add(1);
    }

    #[test]
    fn test_debug_output() {
        let counter = WindowSizeCounter::new(4);
        counter.add(2);
        let debug_str = format!("{:?}", counter);

        assert!(debug_str.contains("WindowSizeCounter"));
        assert!(debug_str.contains("value: 2"));
        assert!(debug_str.contains("suspend_threshold: 4"));
    }
}
