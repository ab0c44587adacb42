use crate::protocol::{Endpoint, DEFAULT_DOWNLOAD_MESSAGE_SIZE};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

/// Default port of the speed-test server.
pub const DEFAULT_PORT: u16 = 4000;

/// Direction of a throughput test.
///
/// # Examples
///
/// ```
/// use wsperf::{Config, Mode};
///
/// let config = Config::client("127.0.0.1:4000").with_mode(Mode::Upload);
/// assert!(config.mode.is_upload());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Client streams data to the server's sink endpoint
    Upload,
    /// Server streams data from its source endpoint to the client
    Download,
}

impl Mode {
    pub fn is_upload(self) -> bool {
        matches!(self, Mode::Upload)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Upload => f.write_str("upload"),
            Mode::Download => f.write_str("download"),
        }
    }
}

/// Client configuration for a measurement run.
///
/// Use [`Config::client`] and the `with_*` builder methods to customize it.
/// Values that a caller may want to change per run (target, parallelism, mode)
/// can also be supplied through [`TestOptions`] when connecting.
///
/// # Examples
///
/// ```
/// use wsperf::{Config, Mode};
/// use std::time::Duration;
///
/// let config = Config::client("speedtest.example.net:4000")
///     .with_parallel(4)
///     .with_mode(Mode::Download)
///     .with_max_test_duration(Duration::from_secs(8));
///
/// assert_eq!(config.parallel, 4);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server to measure against: `host:port` or a `ws://host:port` base URL
    pub target: Option<String>,

    /// Number of parallel streams
    pub parallel: usize,

    /// Test direction
    pub mode: Mode,

    /// A stream stops itself once its samples span this long
    pub max_test_duration: Duration,

    /// Chunk size requested from the server in download mode
    pub download_message_size: usize,

    /// Upper bound for a single WebSocket handshake
    pub connect_timeout: Duration,

    /// Polling cadence used by the reporting driver
    pub interval: Duration,

    /// Output a JSON summary instead of per-poll lines
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: None,
            parallel: 1,
            mode: Mode::Download,
            max_test_duration: Duration::from_millis(8000),
            download_message_size: DEFAULT_DOWNLOAD_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(10),
            interval: Duration::from_millis(250),
            json: false,
        }
    }
}

impl Config {
    /// Creates a configuration with default values and no target.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a client configuration for the given target.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::Config;
    ///
    /// let config = Config::client("127.0.0.1:4000");
    /// assert_eq!(config.target.as_deref(), Some("127.0.0.1:4000"));
    /// ```
    pub fn client(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Default::default()
        }
    }

    /// Sets the number of parallel streams.
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Sets the test direction.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the per-stream test duration ceiling.
    pub fn with_max_test_duration(mut self, duration: Duration) -> Self {
        self.max_test_duration = duration;
        self
    }

    /// Sets the chunk size requested from the server in download mode.
    pub fn with_download_message_size(mut self, size: usize) -> Self {
        self.download_message_size = size;
        self
    }

    /// Sets the WebSocket handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the polling cadence of the reporting driver.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Enables or disables JSON summary output.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Overlays caller-supplied options onto this configuration.
    ///
    /// Only the fields set in `options` are changed.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::{Config, Mode, TestOptions};
    ///
    /// let mut config = Config::client("a:4000").with_parallel(2);
    /// config.merge(TestOptions::new().with_mode(Mode::Upload));
    ///
    /// assert_eq!(config.parallel, 2);
    /// assert_eq!(config.mode, Mode::Upload);
    /// ```
    pub fn merge(&mut self, options: TestOptions) {
        if let Some(target) = options.target {
            self.target = Some(target);
        }
        if let Some(parallel) = options.parallel {
            self.parallel = parallel;
        }
        if let Some(mode) = options.mode {
            self.mode = mode;
        }
    }

    /// Checks the invariants a measurement run depends on.
    pub fn validate(&self) -> Result<()> {
        if self.parallel == 0 {
            return Err(Error::Config(
                "Parallelism must be at least 1".to_string(),
            ));
        }
        if self.max_test_duration.is_zero() {
            return Err(Error::Config(
                "Maximum test duration must be non-zero".to_string(),
            ));
        }
        self.endpoint_url().map(|_| ())
    }

    /// Builds the WebSocket URL of the endpoint matching the configured mode.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::{Config, Mode};
    ///
    /// let config = Config::client("10.0.0.1:4000").with_mode(Mode::Upload);
    /// assert_eq!(config.endpoint_url().unwrap(), "ws://10.0.0.1:4000/speedtest/sink");
    /// ```
    pub fn endpoint_url(&self) -> Result<String> {
        let target = self
            .target
            .as_deref()
            .ok_or_else(|| Error::Config("Server target is required".to_string()))?;

        let base = if target.contains("://") {
            target.to_string()
        } else {
            format!("ws://{}", target)
        };

        let mut url = Url::parse(&base)
            .map_err(|e| Error::Config(format!("Invalid target '{}': {}", target, e)))?;

        if url.scheme() != "ws" {
            return Err(Error::Config(format!(
                "Unsupported scheme '{}' in target '{}', expected ws",
                url.scheme(),
                target
            )));
        }
        if url.host_str().is_none() {
            return Err(Error::Config(format!("Target '{}' has no host", target)));
        }

        url.set_path(Endpoint::for_mode(self.mode).path());
        url.set_query(None);
        Ok(url.to_string())
    }
}

/// Per-run overrides passed to [`SpeedTest::connect`](crate::SpeedTest::connect).
#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub target: Option<String>,
    pub parallel: Option<usize>,
    pub mode: Option<Mode>,
}

impl TestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Configuration for the speed-test server.
///
/// # Examples
///
/// ```
/// use wsperf::ServerConfig;
///
/// // Pace every download connection at 2 MB/s
/// let config = ServerConfig::new(4000).with_rate_limit(2_000_000);
/// assert_eq!(config.rate_limit, Some(2_000_000));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port number to listen on
    pub port: u16,

    /// Bind address (all interfaces when unset)
    pub bind_addr: Option<IpAddr>,

    /// Per-connection download pacing in bytes per second
    pub rate_limit: Option<u64>,

    /// Lifetime of an upload connection
    pub sink_timeout: Duration,

    /// How long a download connection streams without hearing from the client
    pub source_idle_timeout: Duration,

    /// Take the client address from `X-Forwarded-For`, `X-Real-Ip` or
    /// `Forwarded` headers. Loopback peers are always trusted.
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind_addr: None,
            rate_limit: None,
            sink_timeout: Duration::from_secs(20),
            source_idle_timeout: Duration::from_secs(20),
            trust_forwarded_headers: false,
        }
    }
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    pub fn with_rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.rate_limit = Some(bytes_per_sec);
        self
    }

    pub fn with_sink_timeout(mut self, timeout: Duration) -> Self {
        self.sink_timeout = timeout;
        self
    }

    pub fn with_source_idle_timeout(mut self, timeout: Duration) -> Self {
        self.source_idle_timeout = timeout;
        self
    }

    /// Use proxy headers for the address reported by the wsip endpoint.
    pub fn with_forwarded_headers(mut self, trust: bool) -> Self {
        self.trust_forwarded_headers = trust;
        self
    }

    /// Address string the listener binds to.
    pub fn listen_addr(&self) -> String {
        match self.bind_addr {
            Some(IpAddr::V6(addr)) => format!("[{}]:{}", addr, self.port),
            Some(addr) => format!("{}:{}", addr, self.port),
            None => format!("0.0.0.0:{}", self.port),
        }
    }
}
