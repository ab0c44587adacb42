//! Multi-stream measurement coordinator.
//!
//! [`SpeedTest`] owns a set of [`StreamWorker`]s, starts them together, and
//! folds their counters into one smoothed reading each time it is polled.
//! In upload mode every poll also feeds the per-stream rate back into the
//! shared [`SendBuffer`] so frames grow as the link proves faster.

use crate::config::{Config, TestOptions};
use crate::measurements::{Snapshot, StreamStats};
use crate::send_buffer::SendBuffer;
use crate::smoothing::RateSmoother;
use crate::worker::{StreamWorker, WorkerHandle};
use crate::{Error, Result};
use futures::future::{self, BoxFuture, FutureExt};
use log::{debug, info};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// A throughput test over one or more parallel WebSocket streams.
///
/// The lifecycle is `connect` → `run_test` → `poll`… → `stop`, and it can be
/// repeated: a new `connect` tears down whatever the previous run left behind.
///
/// # Examples
///
/// ```no_run
/// use wsperf::{Config, Mode, SpeedTest, TestOptions};
/// use std::time::Duration;
///
/// # async fn example() -> wsperf::Result<()> {
/// let mut test = SpeedTest::new(Config::client("127.0.0.1:4000"))?;
/// test.connect(TestOptions::new().with_parallel(4).with_mode(Mode::Download))
///     .await?;
///
/// let mut run = test.run_test()?;
/// loop {
///     tokio::select! {
///         result = &mut run => { result?; break; }
///         _ = tokio::time::sleep(Duration::from_millis(250)) => {
///             let snapshot = test.poll();
///             println!("{:.2} MB/s", snapshot.combined_rate);
///         }
///     }
/// }
/// test.stop();
/// # Ok(())
/// # }
/// ```
pub struct SpeedTest {
    config: Config,
    workers: Vec<WorkerHandle>,
    idle: Vec<StreamWorker>,
    smoother: RateSmoother,
    send_buffer: SendBuffer,
}

impl SpeedTest {
    /// Creates an unconnected test.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config.parallel` is zero.
    pub fn new(config: Config) -> Result<Self> {
        if config.parallel == 0 {
            return Err(Error::Config(
                "Parallelism must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            config,
            workers: Vec::new(),
            idle: Vec::new(),
            smoother: RateSmoother::new(),
            send_buffer: SendBuffer::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Upload tier handle shared with the streams.
    pub fn send_buffer(&self) -> &SendBuffer {
        &self.send_buffer
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Opens `parallel` streams to the endpoint matching the configured mode.
    ///
    /// Any streams from a previous run are stopped first, and the smoothing
    /// history and upload tier start over. The call resolves once every
    /// stream is ready; if any one of them fails, all are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid options and
    /// [`Error::Connection`] if any stream fails to open.
    pub async fn connect(&mut self, options: TestOptions) -> Result<()> {
        self.stop();
        self.config.merge(options);
        self.config.validate()?;
        let url = self.config.endpoint_url()?;

        self.smoother.reset();
        self.send_buffer.reset();

        info!(
            "Connecting {} {} stream(s) to {}",
            self.config.parallel, self.config.mode, url
        );

        let mut workers: Vec<StreamWorker> = (0..self.config.parallel)
            .map(|id| StreamWorker::new(id, url.clone(), &self.config, self.send_buffer.clone()))
            .collect();

        future::try_join_all(workers.iter_mut().map(|worker| worker.connect())).await?;

        self.workers = workers.iter().map(StreamWorker::handle).collect();
        self.idle = workers;
        debug!("All {} stream(s) connected", self.workers.len());
        Ok(())
    }

    /// Starts every connected stream at once.
    ///
    /// The returned [`TestRun`] resolves after all streams have closed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Test`] if there is nothing to start, either because
    /// `connect` has not succeeded or because this run was already started.
    pub fn run_test(&mut self) -> Result<TestRun> {
        if self.idle.is_empty() {
            let reason = if self.workers.is_empty() {
                "No connected streams, call connect first"
            } else {
                "Test is already running"
            };
            return Err(Error::Test(reason.to_string()));
        }

        info!(
            "Starting {} test with {} stream(s)",
            self.config.mode,
            self.idle.len()
        );

        let tasks = self
            .idle
            .drain(..)
            .map(|worker| tokio::spawn(worker.start()))
            .collect();
        Ok(TestRun::new(tasks))
    }

    /// Combines the current stream counters into one smoothed reading.
    ///
    /// Rates are summed across streams, then limited against the previous
    /// poll and appended to the history behind the trimmed average. Elapsed
    /// time is the longest any stream has sampled. Polling never blocks.
    pub fn poll(&mut self) -> Snapshot {
        let mut cumulative_bytes = 0;
        let mut raw_rate = 0.0;
        let mut elapsed_secs = 0.0f64;

        for worker in &self.workers {
            let (bytes, rate, elapsed) = worker.sample();
            cumulative_bytes += bytes;
            raw_rate += rate;
            elapsed_secs = elapsed_secs.max(elapsed);
        }

        let (combined_rate, average_rate) = self.smoother.update(raw_rate);

        if self.config.mode.is_upload() {
            let per_stream = combined_rate / self.config.parallel as f64;
            if let Some(tier) = self.send_buffer.adapt(per_stream) {
                debug!(
                    "Upload frames grow to {} bytes at {:.3} MB/s per stream",
                    tier.size(),
                    per_stream
                );
            }
        }

        Snapshot {
            cumulative_bytes,
            combined_rate,
            elapsed_secs,
            average_rate,
        }
    }

    /// Per-stream counters, in stream order.
    ///
    /// Unlike [`poll`](Self::poll) this is raw and unsmoothed: each entry is
    /// the stream's own cumulative bytes, last accepted rate, elapsed time and
    /// peak sample. The list is empty before `connect` and after `stop`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use wsperf::{Config, SpeedTest, TestOptions};
    ///
    /// # async fn example() -> wsperf::Result<()> {
    /// let mut test = SpeedTest::new(Config::client("127.0.0.1:4000"))?;
    /// test.connect(TestOptions::new().with_parallel(2)).await?;
    /// test.run_test()?.await?;
    ///
    /// for stats in test.stream_stats() {
    ///     println!("[{}] {} bytes, peak {:.2} MB/s",
    ///         stats.stream_id, stats.cumulative_bytes, stats.peak.rate_mbps);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn stream_stats(&self) -> Vec<StreamStats> {
        self.workers.iter().map(WorkerHandle::stats).collect()
    }

    /// Stops every stream and forgets them. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if !self.workers.is_empty() {
            info!("Stopping {} stream(s)", self.workers.len());
        }
        for worker in &self.workers {
            worker.stop();
        }
        self.workers.clear();
        self.idle.clear();
    }
}

impl Drop for SpeedTest {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Completion of a started test.
///
/// Resolves with `Ok(())` once every stream has closed, whether because it
/// reached the maximum duration, was stopped, or lost its connection.
pub struct TestRun {
    inner: BoxFuture<'static, Result<()>>,
}

impl TestRun {
    fn new(tasks: Vec<JoinHandle<Result<()>>>) -> Self {
        Self {
            inner: join_streams(tasks).boxed(),
        }
    }
}

impl Future for TestRun {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

async fn join_streams(tasks: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    for outcome in future::join_all(tasks).await {
        match outcome {
            Ok(result) => result?,
            Err(e) => return Err(Error::Test(format!("Stream task failed: {}", e))),
        }
    }
    Ok(())
}
