//! Partitioning of a primary-key domain into bounded, resumable windows.
//!
//! A window is a closed range `[low, high]` of primary-key values processed
//! as one unit of work. Windows produced by [`BatchWindowIterator`] are
//! contiguous, non-overlapping, and cover `[min_value, max_value]` exactly;
//! the final window is clamped so its `high` equals `max_value`.

/// A closed `[low, high]` range of primary-key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    /// Inclusive lower bound.
    pub low: i64,
    /// Inclusive upper bound.
    pub high: i64,
}

impl BatchWindow {
    /// Creates a window. `low` must not exceed `high`.
    pub fn new(low: i64, high: i64) -> Self {
        debug_assert!(low <= high, "window bounds out of order");
        Self { low, high }
    }

    /// Number of primary-key values covered by this window. Windows always
    /// cover at least one key.
    pub fn len(&self) -> u64 {
        (self.high - self.low) as u64 + 1
    }

    /// Splits this window into sub-windows of at most `sub_batch_size` keys.
    ///
    /// The backfill processor runs each sub-window in its own short
    /// transaction so row locks are held briefly even when the outer batch
    /// is large. A `sub_batch_size` of zero yields the window unsplit.
    pub fn split(&self, sub_batch_size: u64) -> Vec<BatchWindow> {
        if sub_batch_size == 0 || self.len() <= sub_batch_size {
            return vec![*self];
        }

        BatchWindowIterator::new(self.low, self.high, sub_batch_size).collect()
    }
}

impl std::fmt::Display for BatchWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.low, self.high)
    }
}

/// Lazily yields contiguous [`BatchWindow`]s over `[min_value, max_value]`.
///
/// The iterator is finite and restartable: given a persisted cursor (the
/// `high` of the last completed window), [`BatchWindowIterator::resume`]
/// continues from `cursor + 1` without revisiting completed work. An empty
/// domain (`min_value > max_value`) yields no windows at all.
#[derive(Debug, Clone)]
pub struct BatchWindowIterator {
    next_low: i64,
    max_value: i64,
    batch_size: u64,
}

impl BatchWindowIterator {
    /// Creates an iterator over `[min_value, max_value]` in `batch_size` steps.
    ///
    /// `batch_size` must be at least 1.
    pub fn new(min_value: i64, max_value: i64, batch_size: u64) -> Self {
        assert!(batch_size >= 1, "batch_size must be at least 1");
        Self {
            next_low: min_value,
            max_value,
            batch_size,
        }
    }

    /// Resumes iteration after a persisted cursor.
    ///
    /// The cursor is the inclusive upper bound of the last window whose
    /// mutation committed; the next window starts at `cursor + 1`.
    pub fn resume(cursor: i64, max_value: i64, batch_size: u64) -> Self {
        Self::new(cursor.saturating_add(1), max_value, batch_size)
    }
}

impl Iterator for BatchWindowIterator {
    type Item = BatchWindow;

    fn next(&mut self) -> Option<BatchWindow> {
        if self.next_low > self.max_value {
            return None;
        }

        let span = (self.batch_size - 1) as i64;
        let high = self.next_low.saturating_add(span).min(self.max_value);
        let window = BatchWindow::new(self.next_low, high);
        // saturating_add keeps the iterator fused at i64::MAX
        self.next_low = high.saturating_add(1);
        Some(window)
    }
}
