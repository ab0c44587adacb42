use crate::config::Mode;
use crate::worker::WorkerState;
use serde::{Deserialize, Serialize};

/// Minimum spacing between two accepted samples, in milliseconds.
pub const MIN_SAMPLE_INTERVAL_MS: f64 = 100.0;

/// Outcome of feeding one progress unit into a [`RateSampler`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// First unit of the run; sets the time origin, no rate yet
    Baseline,
    /// Less than [`MIN_SAMPLE_INTERVAL_MS`] since the last accepted sample
    Deferred,
    /// A new rate was computed, in MB/s
    Accepted(f64),
}

/// Largest per-sample rate seen by a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakSample {
    pub rate_mbps: f64,
    pub bytes: u64,
    pub delta_ms: f64,
}

/// Rolling rate estimate for a single stream.
///
/// Every sent or received unit is recorded with its size and a timestamp in
/// milliseconds. Timestamps come from the server clock for uploads and from
/// the local monotonic clock for downloads. The rate is always derived from
/// byte and time deltas between accepted samples, never from totals.
///
/// # Examples
///
/// ```
/// use wsperf::measurements::{RateSampler, SampleOutcome};
///
/// let mut sampler = RateSampler::new();
/// assert_eq!(sampler.record(1_000, 0.0), SampleOutcome::Baseline);
/// assert_eq!(sampler.record(1_000, 50.0), SampleOutcome::Deferred);
/// // 2000 bytes in 200 ms
/// assert_eq!(sampler.record(1_000, 200.0), SampleOutcome::Accepted(0.01));
/// assert_eq!(sampler.cumulative_bytes(), 3_000);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RateSampler {
    cumulative_bytes: u64,
    start_ms: f64,
    last_sample_ms: Option<f64>,
    last_sample_bytes: u64,
    rate_mbps: f64,
    elapsed_secs: f64,
    peak: PeakSample,
}

impl RateSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one unit of `size` bytes observed at `now_ms`.
    ///
    /// The first unit only sets the baseline: its bytes count toward the
    /// total but not toward the first rate, which covers what arrived after
    /// the baseline.
    pub fn record(&mut self, size: u64, now_ms: f64) -> SampleOutcome {
        self.cumulative_bytes += size;

        let last_ms = match self.last_sample_ms {
            Some(last_ms) => last_ms,
            None => {
                self.start_ms = now_ms;
                self.last_sample_ms = Some(now_ms);
                self.last_sample_bytes = self.cumulative_bytes;
                return SampleOutcome::Baseline;
            }
        };

        if now_ms - last_ms < MIN_SAMPLE_INTERVAL_MS {
            return SampleOutcome::Deferred;
        }

        let delta_ms = now_ms - last_ms;
        let delta_bytes = self.cumulative_bytes - self.last_sample_bytes;
        self.last_sample_ms = Some(now_ms);
        self.last_sample_bytes = self.cumulative_bytes;
        self.elapsed_secs = (now_ms - self.start_ms) / 1000.0;

        let bytes_per_sec = delta_bytes as f64 / (delta_ms / 1000.0);
        let rate_mbps = bytes_per_sec / 1_000_000.0;
        if rate_mbps > self.peak.rate_mbps {
            self.peak = PeakSample {
                rate_mbps,
                bytes: delta_bytes,
                delta_ms,
            };
        }
        self.rate_mbps = rate_mbps;
        SampleOutcome::Accepted(rate_mbps)
    }

    pub fn cumulative_bytes(&self) -> u64 {
        self.cumulative_bytes
    }

    /// Rate of the most recent accepted sample, in MB/s.
    pub fn rate_mbps(&self) -> f64 {
        self.rate_mbps
    }

    pub fn peak(&self) -> PeakSample {
        self.peak
    }

    /// Seconds between the baseline and the most recent accepted sample.
    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed_secs
    }

    /// Milliseconds covered by accepted samples, zero before the baseline.
    pub fn sampled_ms(&self) -> f64 {
        self.last_sample_ms
            .map(|last| last - self.start_ms)
            .unwrap_or(0.0)
    }
}

/// Combined reading returned by [`SpeedTest::poll`](crate::SpeedTest::poll).
///
/// Rates are in megabytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub cumulative_bytes: u64,
    pub combined_rate: f64,
    pub elapsed_secs: f64,
    pub average_rate: f64,
}

impl Snapshot {
    /// Smoothed combined rate in bits per second.
    pub fn bits_per_second(&self) -> f64 {
        self.combined_rate * 8_000_000.0
    }

    /// Trimmed average rate in bits per second.
    pub fn average_bits_per_second(&self) -> f64 {
        self.average_rate * 8_000_000.0
    }
}

/// Per-stream statistics exposed for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStats {
    pub stream_id: usize,
    pub state: WorkerState,
    pub cumulative_bytes: u64,
    pub rate_mbps: f64,
    pub elapsed_secs: f64,
    pub peak: PeakSample,
}

/// Final report of a measurement run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub target: String,
    pub mode: Mode,
    pub parallel: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_bytes: u64,
    pub elapsed_secs: f64,
    pub final_rate: f64,
    pub average_rate: f64,
    pub streams: Vec<StreamStats>,
    pub samples: Vec<Snapshot>,
}

impl TestSummary {
    /// Trimmed average in bits per second.
    pub fn average_bits_per_second(&self) -> f64 {
        self.average_rate * 8_000_000.0
    }
}
