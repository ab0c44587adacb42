//! Periodic reporting around a running [`SpeedTest`].
//!
//! [`run_reported`] starts the test, polls it on a fixed cadence until every
//! stream has closed, and hands each reading to an optional
//! [`ProgressCallback`]. The formatting helpers render readings the way
//! iperf does, for the command line.

use crate::config::Mode;
use crate::coordinator::SpeedTest;
use crate::measurements::{Snapshot, TestSummary};
use crate::{Error, Result};
use log::debug;
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};

/// Events emitted while a reported test runs.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// All streams were started.
    TestStarted { mode: Mode, parallel: usize },
    /// One poll of the combined rate.
    Update(Snapshot),
    /// Every stream closed; carries the final summary.
    TestCompleted(TestSummary),
}

/// Receiver of [`ProgressEvent`]s.
///
/// Implemented for any `Fn(ProgressEvent)`, so a closure can be passed
/// directly.
///
/// # Examples
///
/// ```
/// use wsperf::{ProgressCallback, ProgressEvent};
///
/// struct Printer;
///
/// impl ProgressCallback for Printer {
///     fn on_progress(&self, event: ProgressEvent) {
///         if let ProgressEvent::Update(snapshot) = event {
///             println!("{:.2} MB/s", snapshot.combined_rate);
///         }
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Runs a connected test to completion, polling every `interval`.
///
/// The test is stopped before returning, whatever the outcome.
///
/// # Errors
///
/// Returns [`Error::Config`] for a zero `interval`, and
/// [`Error::Test`] if the test has no connected streams or a stream task fails.
pub async fn run_reported(
    test: &mut SpeedTest,
    interval: Duration,
    callback: Option<&dyn ProgressCallback>,
) -> Result<TestSummary> {
    if interval.is_zero() {
        return Err(Error::Config("Report interval must be non-zero".to_string()));
    }
    let mut run = test.run_test()?;
    let config = test.config().clone();

    emit(
        callback,
        ProgressEvent::TestStarted {
            mode: config.mode,
            parallel: config.parallel,
        },
    );

    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    let mut samples = Vec::new();
    let outcome = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = ticker.tick() => {
                let snapshot = test.poll();
                samples.push(snapshot);
                emit(callback, ProgressEvent::Update(snapshot));
            }
        }
    };

    let streams = test.stream_stats();
    test.stop();
    outcome?;

    let last = samples.last().copied().unwrap_or_default();
    let summary = TestSummary {
        target: config.endpoint_url()?,
        mode: config.mode,
        parallel: config.parallel,
        timestamp: chrono::Utc::now(),
        total_bytes: streams.iter().map(|s| s.cumulative_bytes).sum(),
        elapsed_secs: streams.iter().map(|s| s.elapsed_secs).fold(0.0, f64::max),
        final_rate: last.combined_rate,
        average_rate: last.average_rate,
        streams,
        samples,
    };
    debug!(
        "Test finished after {} polls, {} bytes",
        summary.samples.len(),
        summary.total_bytes
    );

    emit(callback, ProgressEvent::TestCompleted(summary.clone()));
    Ok(summary)
}

fn emit(callback: Option<&dyn ProgressCallback>, event: ProgressEvent) {
    if let Some(cb) = callback {
        cb.on_progress(event);
    }
}

fn format_transfer(bytes: u64) -> (f64, &'static str) {
    if bytes >= 1_000_000_000 {
        (bytes as f64 / 1_000_000_000.0, "GBytes")
    } else if bytes >= 1_000_000 {
        (bytes as f64 / 1_000_000.0, "MBytes")
    } else {
        (bytes as f64 / 1_000.0, "KBytes")
    }
}

fn format_bitrate(bits_per_second: f64) -> (f64, &'static str) {
    if bits_per_second >= 1_000_000_000.0 {
        (bits_per_second / 1_000_000_000.0, "Gbits/sec")
    } else {
        (bits_per_second / 1_000_000.0, "Mbits/sec")
    }
}

/// One line per poll: elapsed time, transfer so far, smoothed and average rate.
pub fn format_snapshot(snapshot: &Snapshot) -> String {
    let (transfer, transfer_unit) = format_transfer(snapshot.cumulative_bytes);
    let (rate, rate_unit) = format_bitrate(snapshot.bits_per_second());
    let (average, average_unit) = format_bitrate(snapshot.average_bits_per_second());
    format!(
        "[SUM]   0.00-{:<5.2} sec  {:6.2} {:>7}  {:6.1} {:>10}  (avg {:.1} {})",
        snapshot.elapsed_secs, transfer, transfer_unit, rate, rate_unit, average, average_unit
    )
}

/// Per-stream totals followed by the combined result.
pub fn format_summary(summary: &TestSummary) -> String {
    let mut out = String::from("- - - - - - - - - - - - - - - - - - - - - - - - -\n");
    out.push_str("[ ID]   Interval           Transfer     Peak\n");

    for stream in &summary.streams {
        let (transfer, transfer_unit) = format_transfer(stream.cumulative_bytes);
        let (peak, peak_unit) = format_bitrate(stream.peak.rate_mbps * 8_000_000.0);
        out.push_str(&format!(
            "[{:3}]   0.00-{:<5.2} sec  {:6.2} {:>7}  {:6.1} {:>10}  {}\n",
            stream.stream_id,
            stream.elapsed_secs,
            transfer,
            transfer_unit,
            peak,
            peak_unit,
            stream.state
        ));
    }

    let (transfer, transfer_unit) = format_transfer(summary.total_bytes);
    let (average, average_unit) = format_bitrate(summary.average_bits_per_second());
    out.push_str(&format!(
        "[SUM]   0.00-{:<5.2} sec  {:6.2} {:>7}  {:6.1} {:>10}  {}",
        summary.elapsed_secs, transfer, transfer_unit, average, average_unit, summary.mode
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::{PeakSample, StreamStats};
    use crate::worker::WorkerState;
    use std::sync::Mutex;

    #[test]
    fn test_transfer_units() {
        assert_eq!(format_transfer(500), (0.5, "KBytes"));
        assert_eq!(format_transfer(2_500_000), (2.5, "MBytes"));
        assert_eq!(format_transfer(3_000_000_000), (3.0, "GBytes"));
    }

    #[test]
    fn test_bitrate_units() {
        assert_eq!(format_bitrate(80_000_000.0), (80.0, "Mbits/sec"));
        assert_eq!(format_bitrate(2_000_000_000.0), (2.0, "Gbits/sec"));
    }

    #[test]
    fn test_format_snapshot() {
        let snapshot = Snapshot {
            cumulative_bytes: 12_500_000,
            combined_rate: 10.0,
            elapsed_secs: 1.25,
            average_rate: 9.5,
        };
        let line = format_snapshot(&snapshot);

        assert!(line.starts_with("[SUM]   0.00-1.25"));
        assert!(line.contains("12.50  MBytes"));
        assert!(line.contains("80.0  Mbits/sec"));
        assert!(line.ends_with("(avg 76.0 Mbits/sec)"));
    }

    #[test]
    fn test_format_summary_lists_streams() {
        let summary = TestSummary {
            target: "ws://127.0.0.1:4000/speedtest/source".to_string(),
            mode: Mode::Download,
            parallel: 2,
            timestamp: chrono::Utc::now(),
            total_bytes: 4_000_000,
            elapsed_secs: 2.0,
            final_rate: 2.0,
            average_rate: 2.0,
            streams: (0..2)
                .map(|id| StreamStats {
                    stream_id: id,
                    state: WorkerState::Closed,
                    cumulative_bytes: 2_000_000,
                    rate_mbps: 1.0,
                    elapsed_secs: 2.0,
                    peak: PeakSample {
                        rate_mbps: 1.5,
                        bytes: 150_000,
                        delta_ms: 100.0,
                    },
                })
                .collect(),
            samples: Vec::new(),
        };

        let text = format_summary(&summary);
        assert!(text.contains("[  0]"));
        assert!(text.contains("[  1]"));
        assert!(text.contains("12.0  Mbits/sec  closed"));
        assert!(text.trim_end().ends_with("16.0  Mbits/sec  download"));
    }

    #[test]
    fn test_closure_is_a_callback() {
        let seen = Mutex::new(Vec::new());
        let callback = |event: ProgressEvent| {
            if let ProgressEvent::Update(snapshot) = event {
                seen.lock().unwrap().push(snapshot.cumulative_bytes);
            }
        };
        let callback: &dyn ProgressCallback = &callback;

        emit(Some(callback), ProgressEvent::Update(Snapshot::default()));
        emit(
            Some(callback),
            ProgressEvent::TestStarted {
                mode: Mode::Upload,
                parallel: 1,
            },
        );
        emit(None, ProgressEvent::Update(Snapshot::default()));

        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }
}
