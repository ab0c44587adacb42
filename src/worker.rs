use crate::config::{Config, Mode};
use crate::measurements::{RateSampler, StreamStats};
use crate::protocol::{parse_sink_report, serialize_message, DownloadRequest};
use crate::send_buffer::SendBuffer;
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::{task, time};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a stream waits for its close handshake to flush.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of a stream's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Handshake not finished yet
    Connecting,
    /// Connection open, streaming or ready to stream
    Active,
    /// Terminal: closed normally, stopped, or failed
    Closed,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Connecting => f.write_str("connecting"),
            WorkerState::Active => f.write_str("active"),
            WorkerState::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug)]
struct Shared {
    sampler: Mutex<RateSampler>,
    state: Mutex<WorkerState>,
}

/// Cheap, cloneable view of a stream used by the coordinator.
///
/// The handle stays valid after the stream itself has moved into its
/// streaming task, so counters can be read and `stop` requested at any time.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    id: usize,
    shared: Arc<Shared>,
    stop_token: CancellationToken,
}

impl WorkerHandle {
    fn new(id: usize) -> Self {
        Self {
            id,
            shared: Arc::new(Shared {
                sampler: Mutex::new(RateSampler::new()),
                state: Mutex::new(WorkerState::Connecting),
            }),
            stop_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock()
    }

    /// Requests the stream to stop sending and close. Idempotent.
    pub fn stop(&self) {
        self.stop_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Bytes, current rate (MB/s) and elapsed seconds, read under one lock.
    pub(crate) fn sample(&self) -> (u64, f64, f64) {
        let sampler = self.shared.sampler.lock();
        (
            sampler.cumulative_bytes(),
            sampler.rate_mbps(),
            sampler.elapsed_secs(),
        )
    }

    /// Point-in-time counters for this stream.
    ///
    /// Safe to call from any task while the stream runs; the state and the
    /// sampler are read under their own locks, so a stream that closes in
    /// between may report `Active` with its final byte count.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::{Config, SendBuffer, StreamWorker, WorkerState};
    ///
    /// let worker = StreamWorker::new(3, "ws://127.0.0.1:4000/speedtest/sink".into(),
    ///     &Config::new(), SendBuffer::new());
    /// let stats = worker.handle().stats();
    /// assert_eq!(stats.stream_id, 3);
    /// assert_eq!(stats.state, WorkerState::Connecting);
    /// assert_eq!(stats.cumulative_bytes, 0);
    /// ```
    pub fn stats(&self) -> StreamStats {
        let state = self.state();
        let sampler = self.shared.sampler.lock();
        StreamStats {
            stream_id: self.id,
            state,
            cumulative_bytes: sampler.cumulative_bytes(),
            rate_mbps: sampler.rate_mbps(),
            elapsed_secs: sampler.elapsed_secs(),
            peak: sampler.peak(),
        }
    }

    fn set_state(&self, state: WorkerState) {
        *self.shared.state.lock() = state;
    }
}

/// One measurement connection.
///
/// A worker connects to the sink (upload) or source (download) endpoint,
/// streams until it is stopped, the server closes, or its samples span the
/// configured maximum duration, and keeps a [`RateSampler`] up to date along
/// the way.
pub struct StreamWorker {
    id: usize,
    url: String,
    mode: Mode,
    max_test_duration: Duration,
    download_message_size: usize,
    connect_timeout: Duration,
    send_buffer: SendBuffer,
    handle: WorkerHandle,
    epoch: Instant,
    stream: Option<WsStream>,
}

impl StreamWorker {
    /// Creates a worker for `url`; nothing is opened until [`connect`](Self::connect).
    ///
    /// # Arguments
    ///
    /// * `id` - Stream number used in logs and [`StreamStats::stream_id`]
    /// * `url` - Full endpoint URL, e.g. `ws://host:4000/speedtest/sink`
    /// * `config` - Supplies mode, maximum duration, download chunk size and
    ///   connect timeout
    /// * `send_buffer` - Tier handle shared with the coordinator; read once per
    ///   upload frame
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::{Config, SendBuffer, StreamWorker, WorkerState};
    ///
    /// let worker = StreamWorker::new(
    ///     0,
    ///     "ws://127.0.0.1:4000/speedtest/source".to_string(),
    ///     &Config::new(),
    ///     SendBuffer::new(),
    /// );
    /// assert_eq!(worker.state(), WorkerState::Connecting);
    /// ```
    pub fn new(id: usize, url: String, config: &Config, send_buffer: SendBuffer) -> Self {
        Self {
            id,
            url,
            mode: config.mode,
            max_test_duration: config.max_test_duration,
            download_message_size: config.download_message_size,
            connect_timeout: config.connect_timeout,
            send_buffer,
            handle: WorkerHandle::new(id),
            epoch: Instant::now(),
            stream: None,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// Opens the WebSocket and waits until it is ready to stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] if the handshake fails, the peer closes
    /// before the handshake completes, or the connect timeout elapses.
    pub async fn connect(&mut self) -> Result<()> {
        self.handle.set_state(WorkerState::Connecting);
        debug!("Stream {}: connecting to {}", self.id, self.url);

        match time::timeout(self.connect_timeout, connect_async(self.url.as_str())).await {
            Ok(Ok((stream, _response))) => {
                self.stream = Some(stream);
                self.handle.set_state(WorkerState::Active);
                debug!("Stream {}: connected", self.id);
                Ok(())
            }
            Ok(Err(e)) => {
                self.handle.set_state(WorkerState::Closed);
                Err(Error::Connection(format!("{}: {}", self.url, e)))
            }
            Err(_) => {
                self.handle.set_state(WorkerState::Closed);
                Err(Error::Connection(format!(
                    "{}: handshake timed out after {:?}",
                    self.url, self.connect_timeout
                )))
            }
        }
    }

    /// Streams until the connection closes.
    ///
    /// Upload sends one frame of the current tier size at a time, waiting for
    /// each to flush and yielding before the next. Download sends a single
    /// request and counts the frames that come back. Either way the future
    /// resolves with `Ok(())` once the connection is closed, whether by
    /// [`stop`](Self::stop), by reaching the maximum test duration, or by the
    /// transport going away mid-test.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Test`] if the worker was never connected.
    pub async fn start(mut self) -> Result<()> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::Test(format!("Stream {} is not connected", self.id)))?;

        let (mut sink, mut source) = stream.split();

        match self.mode {
            Mode::Upload => {
                tokio::join!(self.push_data(&mut sink), self.receive(&mut source));
            }
            Mode::Download => {
                tokio::join!(self.request_download(&mut sink), self.receive(&mut source));
            }
        }

        match time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Stream {}: close: {}", self.id, e),
            Err(_) => debug!("Stream {}: close handshake timed out", self.id),
        }
        self.handle.set_state(WorkerState::Closed);

        let stats = self.handle.stats();
        info!(
            "Stream {}: finished, {} bytes in {:.2}s, peak {:.2} MB/s",
            self.id, stats.cumulative_bytes, stats.elapsed_secs, stats.peak.rate_mbps
        );
        Ok(())
    }

    /// Stops sending and closes the connection. Idempotent.
    ///
    /// A worker stopped before [`start`](Self::start) closes as soon as it starts.
    pub fn stop(&self) {
        self.handle.stop();
    }

    async fn push_data(&self, sink: &mut SplitSink<WsStream, Message>) {
        let stop = &self.handle.stop_token;

        while !stop.is_cancelled() {
            let payload = self.send_buffer.payload();
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                sent = sink.send(Message::Binary(payload)) => {
                    if let Err(e) = sent {
                        debug!("Stream {}: {}", self.id, Error::Transport(e.to_string()));
                        stop.cancel();
                        break;
                    }
                }
            }
            task::yield_now().await;
        }
    }

    async fn request_download(&self, sink: &mut SplitSink<WsStream, Message>) {
        let stop = &self.handle.stop_token;
        if stop.is_cancelled() {
            return;
        }

        let request = DownloadRequest::start(self.download_message_size);
        let sent = match serialize_message(&request) {
            Ok(text) => tokio::select! {
                biased;
                _ = stop.cancelled() => return,
                sent = sink.send(Message::Text(text)) => sent.map_err(Error::from),
            },
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => {
                debug!(
                    "Stream {}: requested {} byte chunks",
                    self.id, self.download_message_size
                );
                stop.cancelled().await;
            }
            Err(e) => {
                debug!("Stream {}: download request failed: {}", self.id, e);
                stop.cancel();
            }
        }
    }

    async fn receive(&self, source: &mut SplitStream<WsStream>) {
        let stop = &self.handle.stop_token;

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) if !self.mode.is_upload() => {
                    self.update_progress(data.len() as u64, self.local_ms());
                }
                Some(Ok(Message::Text(text))) if self.mode.is_upload() => {
                    match parse_sink_report(&text) {
                        Ok(report) => {
                            self.update_progress(report.messagesize as u64, report.timestamp)
                        }
                        Err(e) => warn!(
                            "Stream {}: skipping malformed control message: {}",
                            self.id, e
                        ),
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Stream {}: closed by server {:?}", self.id, frame);
                    break;
                }
                Some(Ok(other)) => {
                    debug!(
                        "Stream {}: ignoring unexpected {} byte frame",
                        self.id,
                        other.len()
                    );
                }
                Some(Err(e)) => {
                    debug!("Stream {}: {}", self.id, Error::Transport(e.to_string()));
                    break;
                }
                None => {
                    debug!("Stream {}: connection ended", self.id);
                    break;
                }
            }
        }

        // Whatever ended the receive side also ends the send side.
        stop.cancel();
    }

    /// Records one sent or received unit and enforces the duration ceiling.
    fn update_progress(&self, size: u64, now_ms: f64) {
        let sampled_ms = {
            let mut sampler = self.handle.shared.sampler.lock();
            sampler.record(size, now_ms);
            sampler.sampled_ms()
        };

        if sampled_ms >= self.max_test_duration.as_millis() as f64 && !self.handle.is_stopped() {
            info!(
                "Stream {}: reached maximum test duration of {:?}",
                self.id, self.max_test_duration
            );
            self.stop();
        }
    }

    /// Local monotonic clock in milliseconds.
    fn local_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
impl WorkerHandle {
    /// A handle with no connection behind it, fed by tests directly.
    pub(crate) fn detached(id: usize) -> Self {
        Self::new(id)
    }

    pub(crate) fn record(&self, size: u64, now_ms: f64) {
        self.shared.sampler.lock().record(size, now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn worker(url: &str, config: &Config) -> StreamWorker {
        StreamWorker::new(0, url.to_string(), config, SendBuffer::new())
    }

    #[test]
    fn test_new_worker_is_connecting() {
        let w = worker("ws://127.0.0.1:9/speedtest/source", &Config::new());
        assert_eq!(w.state(), WorkerState::Connecting);
        assert_eq!(w.id(), 0);
        assert!(!w.handle().is_stopped());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let w = worker("ws://127.0.0.1:9/speedtest/source", &Config::new());
        w.stop();
        w.stop();
        assert!(w.handle().is_stopped());
    }

    #[test]
    fn test_update_progress_self_stops_at_max_duration() {
        let config = Config::new().with_max_test_duration(Duration::from_millis(1000));
        let w = worker("ws://127.0.0.1:9/speedtest/source", &config);

        w.update_progress(1_000, 5_000.0);
        w.update_progress(1_000, 5_500.0);
        assert!(!w.handle().is_stopped());

        w.update_progress(1_000, 6_000.0);
        assert!(w.handle().is_stopped());

        let stats = w.handle().stats();
        assert_eq!(stats.cumulative_bytes, 3_000);
        assert_eq!(stats.elapsed_secs, 1.0);
    }

    #[test]
    fn test_deferred_samples_do_not_advance_the_clock() {
        let config = Config::new().with_max_test_duration(Duration::from_millis(100));
        let w = worker("ws://127.0.0.1:9/speedtest/source", &config);

        w.update_progress(10, 0.0);
        w.update_progress(10, 99.0);
        assert!(!w.handle().is_stopped());
        w.update_progress(10, 100.0);
        assert!(w.handle().is_stopped());
    }

    #[tokio::test]
    async fn test_start_without_connect_fails() {
        let w = worker("ws://127.0.0.1:9/speedtest/source", &Config::new());
        assert!(matches!(w.start().await, Err(Error::Test(_))));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut w = worker(&format!("ws://{}/speedtest/source", addr), &Config::new());
        let result = w.connect().await;

        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(w.state(), WorkerState::Closed);
    }

    #[tokio::test]
    async fn test_connect_times_out_on_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Accept, then never answer the handshake
            let (socket, _) = listener.accept().await.unwrap();
            time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let config = Config::new().with_connect_timeout(Duration::from_millis(200));
        let mut w = worker(&format!("ws://{}/speedtest/source", addr), &config);
        let result = w.connect().await;

        assert!(matches!(result, Err(Error::Connection(msg)) if msg.contains("timed out")));
        server.abort();
    }
}
