use crate::config::ServerConfig;
use crate::protocol::{
    parse_download_request, serialize_message, unix_micros, DownloadRequest, Endpoint, IpResponse,
    SinkReport,
};
use crate::token_bucket::TokenBucket;
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderMap, StatusCode};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

type WsStream = WebSocketStream<TcpStream>;

/// Speed-test server answering the sink and source endpoints.
///
/// Every accepted connection is handled in its own task. Upload traffic sent
/// to `/speedtest/sink` is acknowledged frame by frame with a [`SinkReport`];
/// `/speedtest/source` streams timestamped data after a [`DownloadRequest`];
/// `/speedtest/wsip` answers once with the client's address.
/// Any other path is refused during the handshake with `404 Not Found`.
///
/// # Examples
///
/// ```no_run
/// use wsperf::{Server, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> wsperf::Result<()> {
/// let server = Server::new(ServerConfig::new(4000));
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured address and serves until the task is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("Speed-test server listening on {}", addr);
        self.serve(listener).await
    }

    /// Serves connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        if let Some(rate) = self.config.rate_limit {
            info!("Pacing downloads at {} bytes/s per stream", rate);
        }

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("New connection from {}", addr);
                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, addr, config).await {
                            warn!("Error handling client {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, config: ServerConfig) -> Result<()> {
    let mut endpoint = None;
    let mut client = addr;
    let trust_headers = config.trust_forwarded_headers;
    let ws = accept_hdr_async(stream, |request: &Request, response: Response| {
        let path = request.uri().path();
        match Endpoint::from_path(path) {
            Some(found) => {
                if found == Endpoint::Ip {
                    client = client_addr(addr, trust_headers, request.headers());
                }
                endpoint = Some(found);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some(format!("No endpoint at {}", path)));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    })
    .await?;

    match endpoint {
        Some(Endpoint::Sink) => run_sink(ws, addr, &config).await,
        Some(Endpoint::Source) => run_source(ws, addr, &config).await,
        Some(Endpoint::Ip) => run_ip(ws, client).await,
        None => Err(Error::Protocol("Handshake accepted without an endpoint".to_string())),
    }
}

/// Resolves the address reported to the client.
///
/// Proxy headers are consulted for loopback peers, or for any peer when
/// `trust_headers` is set, in the order `X-Forwarded-For`, `X-Real-Ip`,
/// `Forwarded`. A header-derived address without a port carries port 0.
fn client_addr(peer: SocketAddr, trust_headers: bool, headers: &HeaderMap) -> SocketAddr {
    if !(trust_headers || peer.ip().is_loopback()) {
        return peer;
    }

    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok());
    header("x-forwarded-for")
        .and_then(parse_forwarded_for)
        .or_else(|| header("x-real-ip").and_then(parse_forwarded_for))
        .or_else(|| header("forwarded").and_then(parse_forwarded))
        .unwrap_or(peer)
}

/// First entry of a comma-separated address list.
fn parse_forwarded_for(value: &str) -> Option<SocketAddr> {
    value.split(',').next().and_then(parse_addr)
}

/// `for=` parameter of the first element of a `Forwarded` header.
fn parse_forwarded(value: &str) -> Option<SocketAddr> {
    let element = value.split(',').next()?;
    element
        .split(';')
        .map(|pair| pair.trim().to_lowercase())
        .find_map(|pair| pair.strip_prefix("for=").and_then(parse_addr))
}

fn parse_addr(value: &str) -> Option<SocketAddr> {
    let value = value.trim().trim_matches('"');
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, 0))
        .or_else(|_| value.parse::<SocketAddr>())
        .ok()
}

/// Sends the client its address in one text frame, then closes.
async fn run_ip(mut ws: WsStream, client: SocketAddr) -> Result<()> {
    let reply = serialize_message(&IpResponse::from_addr(client))?;
    debug!("Ip: sending {}", reply);
    ws.send(Message::Text(reply)).await?;

    if let Err(e) = ws.close(None).await {
        debug!("Ip {}: close: {}", client, e);
    }
    Ok(())
}

/// Acknowledges every binary frame until the client closes or the sink
/// lifetime runs out.
async fn run_sink(ws: WsStream, addr: SocketAddr, config: &ServerConfig) -> Result<()> {
    let (mut tx, mut rx) = ws.split();
    let mut received = 0u64;

    let acknowledge = async {
        while let Some(message) = rx.next().await {
            match message? {
                Message::Binary(data) => {
                    received += data.len() as u64;
                    let report = serialize_message(&SinkReport::now(data.len()))?;
                    tx.send(Message::Text(report)).await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok::<(), Error>(())
    };

    match time::timeout(config.sink_timeout, acknowledge).await {
        Ok(result) => result?,
        Err(_) => debug!("Sink {}: closing after {:?}", addr, config.sink_timeout),
    }

    if let Err(e) = tx.close().await {
        debug!("Sink {}: close: {}", addr, e);
    }
    info!("Sink {}: received {} bytes", addr, received);
    Ok(())
}

/// Streams data after the client's first text frame, until the client sends
/// anything else or stays silent for the idle timeout.
async fn run_source(ws: WsStream, addr: SocketAddr, config: &ServerConfig) -> Result<()> {
    let (mut tx, mut rx) = ws.split();

    let request = match read_request(&mut rx).await? {
        Some(request) => request,
        None => {
            debug!("Source {}: client left before requesting data", addr);
            return Ok(());
        }
    };

    let size = request.effective_message_size();
    debug!("Source {}: streaming {} byte chunks", addr, size);
    let payload = vec![0u8; size];
    let mut bucket = config.rate_limit.map(TokenBucket::new);

    tokio::select! {
        result = stream_blobs(&mut tx, &payload, bucket.as_mut()) => {
            if let Err(e) = result {
                debug!("Source {}: {}", addr, e);
            }
        }
        heard = time::timeout(config.source_idle_timeout, rx.next()) => {
            if heard.is_err() {
                debug!("Source {}: no word from client in {:?}", addr, config.source_idle_timeout);
            }
        }
    }

    if let Err(e) = tx.close().await {
        debug!("Source {}: close: {}", addr, e);
    }
    Ok(())
}

async fn read_request(rx: &mut SplitStream<WsStream>) -> Result<Option<DownloadRequest>> {
    while let Some(message) = rx.next().await {
        match message? {
            Message::Text(text) => return parse_download_request(&text).map(Some),
            Message::Close(_) => return Ok(None),
            Message::Binary(_) => {
                return Err(Error::Protocol(
                    "Expected a download request, got binary data".to_string(),
                ))
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Sends an 8-byte big-endian microsecond timestamp, then the payload, forever.
async fn stream_blobs(
    tx: &mut SplitSink<WsStream, Message>,
    payload: &[u8],
    mut bucket: Option<&mut TokenBucket>,
) -> Result<()> {
    loop {
        if let Some(bucket) = bucket.as_deref_mut() {
            bucket.consume(payload.len() + 8).await;
        }
        tx.send(Message::Binary(unix_micros().to_be_bytes().to_vec()))
            .await?;
        tx.send(Message::Binary(payload.to_vec())).await?;
    }
}
