//! Fixed-size moving-average window for utilization signals.
//!
//! The window is zero-initialized and holds the last `W` utilization
//! fractions. Its average is withheld until `W` samples have been pushed, so a
//! freshly started monitor never reports a partially filled mean.

// =============================================================================
// MovingAverageWindow
// =============================================================================

/// Default number of samples averaged by CPU and memory monitors.
pub const DEFAULT_WINDOW_SIZE: usize = 120;

/// Largest window allocated: one day of one-second samples.
pub const MAX_WINDOW_SIZE: usize = 86_400;

/// Circular buffer of utilization fractions (0.0 ..= 1.0).
///
/// # Example
///
/// ```ignore
/// let mut w = MovingAverageWindow::new(2);
/// assert_eq!(w.push(0.5), None);
/// assert_eq!(w.push(0.7), Some(60.0));
/// ```
#[derive(Debug, Clone)]
pub struct MovingAverageWindow {
    slots: Vec<f64>,
    head: usize, // next write position
    total: u64,  // samples ever pushed
}

impl MovingAverageWindow {
    /// Create a window of `size` slots, clamped to `1..=MAX_WINDOW_SIZE`.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![0.0; size.clamp(1, MAX_WINDOW_SIZE)],
            head: 0,
            total: 0,
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Whether `W` samples have been observed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.total >= self.slots.len() as u64
    }

    /// Total samples ever pushed.
    #[must_use]
    pub fn total_pushed(&self) -> u64 {
        self.total
    }

    /// Record a fraction, evicting the oldest slot.
    ///
    /// Returns the window average as a percentage once the window is ready.
    pub fn push(&mut self, fraction: f64) -> Option<f64> {
        self.slots[self.head] = fraction;
        self.head = (self.head + 1) % self.slots.len();
        self.total += 1;
        self.average_percent()
    }

    /// Average of all slots × 100, or `None` before the window is ready.
    #[must_use]
    pub fn average_percent(&self) -> Option<f64> {
        if !self.is_ready() {
            return None;
        }
        let sum: f64 = self.slots.iter().sum();
        Some(sum / self.slots.len() as f64 * 100.0)
    }
}

impl Default for MovingAverageWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn withheld_until_full() {
        let mut w = MovingAverageWindow::new(3);
        assert_eq!(w.push(1.0), None);
        assert_eq!(w.push(1.0), None);
        assert!(!w.is_ready());
        let avg = w.push(1.0).unwrap();
        assert!(approx(avg, 100.0));
        assert!(w.is_ready());
    }

    #[test]
    fn evicts_oldest() {
        let mut w = MovingAverageWindow::new(2);
        w.push(0.2);
        assert!(approx(w.push(0.4).unwrap(), 30.0));
        // 0.2 evicted
        assert!(approx(w.push(0.8).unwrap(), 60.0));
        // 0.4 evicted
        assert!(approx(w.push(0.0).unwrap(), 40.0));
    }

    #[test]
    fn default_size_is_120() {
        let mut w = MovingAverageWindow::default();
        assert_eq!(w.capacity(), 120);
        for _ in 0..119 {
            assert!(w.push(0.85).is_none());
        }
        assert!(approx(w.push(0.85).unwrap(), 85.0));
        assert_eq!(w.total_pushed(), 120);
    }

    #[test]
    fn zero_size_clamps_to_one() {
        let mut w = MovingAverageWindow::new(0);
        assert_eq!(w.capacity(), 1);
        assert!(approx(w.push(0.5).unwrap(), 50.0));
    }

    #[test]
    fn oversized_window_is_capped() {
        assert_eq!(MovingAverageWindow::new(usize::MAX).capacity(), MAX_WINDOW_SIZE);
        assert_eq!(MovingAverageWindow::new(MAX_WINDOW_SIZE).capacity(), MAX_WINDOW_SIZE);
    }
}
