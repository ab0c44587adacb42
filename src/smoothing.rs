//! Smoothing applied to the combined rate on every poll.
//!
//! Two stages turn bursty per-stream readings into a display value:
//! a clamp that bounds how far one poll may move the rate, and a trimmed
//! average over the run's history that ignores ramp-up and tail samples.

/// Limits the change from `old_rate` to `new_rate` to half of their midpoint.
///
/// # Examples
///
/// ```
/// use wsperf::smoothing::lowpass;
///
/// assert_eq!(lowpass(100.0, 10.0), 37.5);
/// assert_eq!(lowpass(10.0, 100.0), 72.5);
/// assert_eq!(lowpass(11.0, 10.0), 11.0);
/// ```
pub fn lowpass(new_rate: f64, old_rate: f64) -> f64 {
    let max_delta = (new_rate + old_rate) / 2.0 * 0.5;
    if (old_rate - new_rate).abs() > max_delta {
        if new_rate > old_rate {
            old_rate + max_delta
        } else {
            old_rate - max_delta
        }
    } else {
        new_rate
    }
}

/// Average over the trimmed window of `history`.
///
/// Short histories (fewer than 8 samples) are divided by `len + 3`, which
/// damps the first readings of a run. Histories longer than 10 drop the first
/// 30% and average the following 60%. Indices past the end count as zero.
///
/// # Examples
///
/// ```
/// use wsperf::smoothing::trimmed_average;
///
/// assert_eq!(trimmed_average(&[4.0]), 1.0);
/// assert_eq!(trimmed_average(&[]), 0.0);
/// ```
pub fn trimmed_average(history: &[f64]) -> f64 {
    let mut start = 0;
    let mut len = history.len();
    if len < 8 {
        len += 3;
    }
    if len > 10 {
        start = len * 3 / 10;
        len = len * 6 / 10;
    }

    let total: f64 = (start..start + len)
        .map(|i| history.get(i).copied().unwrap_or(0.0))
        .sum();
    total / len as f64
}

/// Low-pass filter state plus the history feeding the trimmed average.
#[derive(Debug, Clone, Default)]
pub struct RateSmoother {
    last_rate: f64,
    history: Vec<f64>,
}

impl RateSmoother {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filters `raw_rate` against the previous reading and records it.
    ///
    /// Returns `(filtered_rate, average_rate)`.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::smoothing::RateSmoother;
    ///
    /// let mut smoother = RateSmoother::new();
    /// let (rate, average) = smoother.update(8.0);
    /// assert_eq!(rate, 2.0);
    /// assert_eq!(average, 0.5);
    /// ```
    pub fn update(&mut self, raw_rate: f64) -> (f64, f64) {
        let rate = lowpass(raw_rate, self.last_rate);
        self.last_rate = rate;
        self.history.push(rate);
        (rate, trimmed_average(&self.history))
    }

    pub fn last_rate(&self) -> f64 {
        self.last_rate
    }

    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Forgets the previous run.
    pub fn reset(&mut self) {
        self.last_rate = 0.0;
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowpass_clamps_rise() {
        // maxDelta = (100 + 10) / 2 * 0.5 = 27.5
        assert_eq!(lowpass(100.0, 10.0), 37.5);
    }

    #[test]
    fn test_lowpass_clamps_fall() {
        assert_eq!(lowpass(0.0, 8.0), 6.0);
    }

    #[test]
    fn test_lowpass_passes_small_changes() {
        assert_eq!(lowpass(9.0, 8.0), 9.0);
        assert_eq!(lowpass(0.0, 0.0), 0.0);
    }

    #[test]
    fn test_lowpass_bound_holds() {
        let values = [0.0, 0.3, 5.0, 120.0, 7.5, 1e-3, 64.0];
        for &old in &values {
            for &new in &values {
                let out = lowpass(new, old);
                let bound = (new + old) / 2.0 * 0.5;
                assert!((out - old).abs() <= bound + 1e-12, "{} -> {} gave {}", old, new, out);
            }
        }
    }

    #[test]
    fn test_short_history_widens_denominator() {
        assert_eq!(trimmed_average(&[4.0]), 1.0);
        assert_eq!(trimmed_average(&[2.0, 4.0, 6.0]), 2.0);
        // len 7 -> 10, no trimming
        assert_eq!(trimmed_average(&[10.0; 7]), 7.0);
    }

    #[test]
    fn test_mid_history_uses_plain_mean() {
        assert_eq!(trimmed_average(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]), 4.5);
        assert_eq!(trimmed_average(&[3.0; 10]), 3.0);
    }

    #[test]
    fn test_long_history_is_trimmed() {
        let history: Vec<f64> = (0..12).map(|i| i as f64).collect();
        // start = 3, len = 7 -> indices 3..=9
        let expected = (3..10).sum::<i32>() as f64 / 7.0;
        assert_eq!(trimmed_average(&history), expected);
    }

    #[test]
    fn test_trimmed_window_ignores_outliers_at_edges() {
        let mut history = vec![0.0, 0.0, 0.0, 0.0];
        history.extend([8.0; 8]);
        history.extend([100.0; 3]);
        // len 15 -> start 4, len 9 -> indices 4..=12 include one outlier
        let expected = (8.0 * 8.0 + 100.0) / 9.0;
        assert_eq!(trimmed_average(&history), expected);
    }

    #[test]
    fn test_smoother_tracks_last_rate_and_history() {
        let mut smoother = RateSmoother::new();
        smoother.update(100.0);
        assert_eq!(smoother.last_rate(), 25.0);

        smoother.update(100.0);
        // 25 + (125 / 4)
        assert_eq!(smoother.last_rate(), 56.25);
        assert_eq!(smoother.history(), &[25.0, 56.25]);

        smoother.reset();
        assert_eq!(smoother.last_rate(), 0.0);
        assert!(smoother.history().is_empty());
    }

    #[test]
    fn test_smoother_converges_on_steady_input() {
        let mut smoother = RateSmoother::new();
        let mut average = 0.0;
        for _ in 0..16 {
            average = smoother.update(8.0).1;
        }
        assert_eq!(smoother.last_rate(), 8.0);
        assert!((average - 8.0).abs() < 1e-9);
    }
}
