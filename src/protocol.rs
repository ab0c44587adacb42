//! Wire format shared by the measurement client and the speed-test server.
//!
//! Data travels in binary WebSocket frames. Control information travels in
//! small JSON text frames:
//!
//! - Download: the client sends one [`DownloadRequest`] to the source endpoint,
//!   then the server streams an 8-byte big-endian timestamp frame followed by a
//!   data frame of the requested size, over and over.
//! - Upload: the client streams binary frames to the sink endpoint and the
//!   server answers each with a [`SinkReport`] stamped with its own clock.
//! - Address lookup: the server answers a connection to the wsip endpoint
//!   with a single [`IpResponse`] and closes.

use crate::config::Mode;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::{SystemTime, UNIX_EPOCH};

/// URL path of the upload endpoint.
pub const SINK_PATH: &str = "/speedtest/sink";

/// URL path of the download endpoint.
pub const SOURCE_PATH: &str = "/speedtest/source";

/// URL path of the endpoint that reports the client's address.
pub const IP_PATH: &str = "/speedtest/wsip";

/// Chunk size used when a download request does not name one.
pub const DEFAULT_DOWNLOAD_MESSAGE_SIZE: usize = 100_000;

/// Smallest chunk the server will stream.
pub const MIN_DOWNLOAD_MESSAGE_SIZE: usize = 125;

/// Largest chunk the server will stream.
pub const MAX_DOWNLOAD_MESSAGE_SIZE: usize = 10_000_000;

/// Server endpoint a stream talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    /// Receives upload traffic and reports progress
    Sink,
    /// Streams download traffic
    Source,
    /// Reports the client's address once
    Ip,
}

impl Endpoint {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Upload => Endpoint::Sink,
            Mode::Download => Endpoint::Source,
        }
    }

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Sink => SINK_PATH,
            Endpoint::Source => SOURCE_PATH,
            Endpoint::Ip => IP_PATH,
        }
    }

    /// Resolves a request path; a single trailing slash is tolerated.
    ///
    /// # Examples
    ///
    /// ```
    /// use wsperf::protocol::Endpoint;
    ///
    /// assert_eq!(Endpoint::from_path("/speedtest/sink/"), Some(Endpoint::Sink));
    /// assert_eq!(Endpoint::from_path("/speedtest/ip"), None);
    /// ```
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.strip_suffix('/').unwrap_or(path);
        match path {
            SINK_PATH => Some(Endpoint::Sink),
            SOURCE_PATH => Some(Endpoint::Source),
            IP_PATH => Some(Endpoint::Ip),
            _ => None,
        }
    }
}

/// Control message that starts a download stream.
///
/// The server also accepts the capitalised key spelling used by older clients.
///
/// # Examples
///
/// ```
/// use wsperf::protocol::{serialize_message, DownloadRequest};
///
/// let json = serialize_message(&DownloadRequest::start(100_000)).unwrap();
/// assert_eq!(json, r#"{"download":"start","messagesize":100000}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadRequest {
    #[serde(alias = "Download", default)]
    pub download: String,
    #[serde(alias = "MessageSize", default)]
    pub messagesize: usize,
}

impl DownloadRequest {
    pub fn start(messagesize: usize) -> Self {
        Self {
            download: "start".to_string(),
            messagesize,
        }
    }

    /// Chunk size the server actually streams for this request.
    ///
    /// Zero selects the default; other values are clamped to
    /// [`MIN_DOWNLOAD_MESSAGE_SIZE`]..=[`MAX_DOWNLOAD_MESSAGE_SIZE`].
    pub fn effective_message_size(&self) -> usize {
        if self.messagesize == 0 {
            return DEFAULT_DOWNLOAD_MESSAGE_SIZE;
        }
        self.messagesize
            .clamp(MIN_DOWNLOAD_MESSAGE_SIZE, MAX_DOWNLOAD_MESSAGE_SIZE)
    }
}

/// Progress report the sink sends back for every upload frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SinkReport {
    /// Server wall clock in milliseconds since the Unix epoch
    pub timestamp: f64,
    /// Size of the frame being acknowledged
    pub messagesize: usize,
}

impl SinkReport {
    pub fn now(messagesize: usize) -> Self {
        Self {
            timestamp: unix_micros() as f64 / 1000.0,
            messagesize,
        }
    }
}

/// Client address as seen by the server.
///
/// IPv4-mapped IPv6 addresses are reported in plain dotted form, and the port
/// is left out when it is unknown.
///
/// # Examples
///
/// ```
/// use wsperf::protocol::{serialize_message, IpResponse};
///
/// let resp = IpResponse::from_addr("[::ffff:192.0.2.1]:0".parse().unwrap());
/// assert_eq!(serialize_message(&resp).unwrap(), r#"{"remoteip":"192.0.2.1"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpResponse {
    pub remoteip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remoteport: Option<u16>,
}

impl IpResponse {
    pub fn from_addr(addr: SocketAddr) -> Self {
        let ip = match addr.ip() {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
            v4 => v4,
        };
        Self {
            remoteip: ip.to_string(),
            remoteport: Some(addr.port()).filter(|&port| port != 0),
        }
    }
}

/// Serializes a control message into the text of a WebSocket frame.
pub fn serialize_message<T: Serialize>(msg: &T) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Parses the text of a sink control frame.
pub fn parse_sink_report(text: &str) -> Result<SinkReport> {
    Ok(serde_json::from_str(text)?)
}

/// Parses the text of a download request frame.
pub fn parse_download_request(text: &str) -> Result<DownloadRequest> {
    Ok(serde_json::from_str(text)?)
}

/// Wall clock in microseconds since the Unix epoch.
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
