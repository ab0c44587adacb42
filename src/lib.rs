//! wsperf - multi-stream WebSocket throughput measurement
//!
//! This library measures upload and download throughput between a client and
//! a speed-test server over one or more parallel WebSocket connections.
//!
//! # Features
//!
//! - Parallel streams started together and measured as one
//! - Smoothed combined rate with a trimmed run average
//! - Upload frames that grow with the measured per-stream rate
//! - A matching server with sink and source endpoints
//! - Asynchronous I/O using tokio

pub mod config;
pub mod coordinator;
pub mod error;
pub mod interval_reporter;
pub mod measurements;
pub mod protocol;
pub mod send_buffer;
pub mod server;
pub mod smoothing;
pub mod token_bucket;
pub mod worker;

pub use config::{Config, Mode, ServerConfig, TestOptions};
pub use coordinator::{SpeedTest, TestRun};
pub use error::{Error, Result};
pub use interval_reporter::{run_reported, ProgressCallback, ProgressEvent};
pub use measurements::{Snapshot, StreamStats, TestSummary};
pub use send_buffer::{BufferTier, SendBuffer};
pub use server::Server;
pub use worker::{StreamWorker, WorkerHandle, WorkerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
