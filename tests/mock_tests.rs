//! Streams driven by scripted WebSocket peers instead of the real server.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use wsperf::{run_reported, BufferTier, Config, Mode, SpeedTest, TestOptions};

type PeerStream = WebSocketStream<tokio::net::TcpStream>;

/// Accepts one WebSocket connection and hands it to `script`.
async fn mock_peer<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(PeerStream) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        script(ws).await;
    });
    addr
}

/// Reads until the client closes; true if a close frame arrived.
async fn drain(ws: &mut PeerStream) -> bool {
    while let Some(Ok(message)) = ws.next().await {
        if message.is_close() {
            return true;
        }
    }
    false
}

fn report(timestamp: f64, size: usize) -> Message {
    Message::Text(format!(
        r#"{{"timestamp":{},"messagesize":{}}}"#,
        timestamp, size
    ))
}

#[tokio::test]
async fn test_malformed_reports_are_skipped() {
    let addr = mock_peer(|mut ws| async move {
        // Wait for the first upload frame
        ws.next().await;
        ws.send(Message::Text("not json".to_string())).await.unwrap();
        ws.send(report(1_000.0, 500)).await.unwrap();
        ws.send(Message::Text(r#"{"timestamp":"later"}"#.to_string()))
            .await
            .unwrap();
        ws.send(report(1_200.0, 500)).await.unwrap();
        let _ = ws.close(None).await;
        drain(&mut ws).await;
    })
    .await;

    let config = Config::client(addr.to_string())
        .with_mode(Mode::Upload)
        .with_max_test_duration(Duration::from_secs(30));
    let mut test = SpeedTest::new(config).unwrap();
    test.connect(TestOptions::new()).await.unwrap();

    let run = test.run_test().unwrap();
    let result = timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not resolve after the peer closed");
    assert!(result.is_ok());

    let stats = &test.stream_stats()[0];
    assert_eq!(stats.cumulative_bytes, 1_000);
    // 500 bytes over 200 ms of server time
    assert_eq!(stats.rate_mbps, 0.0025);
    assert_eq!(stats.elapsed_secs, 0.2);
}

#[tokio::test]
async fn test_download_sends_start_request() {
    let (request_tx, request_rx) = oneshot::channel();
    let addr = mock_peer(|mut ws| async move {
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let _ = request_tx.send(text);
        }
        ws.send(Message::Binary(vec![0u8; 3_000])).await.unwrap();
        ws.send(Message::Binary(vec![0u8; 4_000])).await.unwrap();
        let _ = ws.close(None).await;
        drain(&mut ws).await;
    })
    .await;

    let mut test = SpeedTest::new(Config::client(addr.to_string())).unwrap();
    test.connect(TestOptions::new().with_mode(Mode::Download))
        .await
        .unwrap();

    let run = test.run_test().unwrap();
    let result = timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not resolve");
    assert!(result.is_ok());

    let request = request_rx.await.unwrap();
    assert_eq!(request, r#"{"download":"start","messagesize":100000}"#);
    assert_eq!(test.stream_stats()[0].cumulative_bytes, 7_000);
}

#[tokio::test]
async fn test_upload_stops_itself_at_max_duration() {
    let (closed_tx, closed_rx) = oneshot::channel();
    let addr = mock_peer(|mut ws| async move {
        ws.next().await;
        // Server clock spans exactly one second
        for timestamp in [10_000.0, 10_500.0, 11_000.0] {
            ws.send(report(timestamp, 1_000)).await.unwrap();
        }
        let _ = closed_tx.send(drain(&mut ws).await);
    })
    .await;

    let config = Config::client(addr.to_string())
        .with_mode(Mode::Upload)
        .with_max_test_duration(Duration::from_secs(1));
    let mut test = SpeedTest::new(config).unwrap();
    test.connect(TestOptions::new()).await.unwrap();

    let run = test.run_test().unwrap();
    let result = timeout(Duration::from_secs(5), run)
        .await
        .expect("stream did not stop at its maximum duration");
    assert!(result.is_ok());

    let closed_by_client = timeout(Duration::from_secs(5), closed_rx)
        .await
        .unwrap()
        .unwrap();
    assert!(closed_by_client);

    let stats = &test.stream_stats()[0];
    assert_eq!(stats.cumulative_bytes, 3_000);
    assert_eq!(stats.elapsed_secs, 1.0);
}

#[tokio::test]
async fn test_upload_frames_grow_with_tier() {
    let (sizes_tx, sizes_rx) = oneshot::channel();
    let addr = mock_peer(|mut ws| async move {
        let start = Instant::now();
        let mut sizes = Vec::new();
        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Binary(data) => {
                    sizes.push(data.len());
                    let now_ms = start.elapsed().as_secs_f64() * 1000.0;
                    if ws.send(report(now_ms, data.len())).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = sizes_tx.send(sizes);
    })
    .await;

    let config = Config::client(addr.to_string())
        .with_mode(Mode::Upload)
        .with_max_test_duration(Duration::from_secs(2));
    let mut test = SpeedTest::new(config).unwrap();
    test.connect(TestOptions::new()).await.unwrap();

    timeout(
        Duration::from_secs(15),
        run_reported(&mut test, Duration::from_millis(100), None),
    )
    .await
    .expect("upload did not finish")
    .unwrap();

    let sizes = timeout(Duration::from_secs(5), sizes_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sizes.first(), Some(&BufferTier::Small.size()));

    // Frames only ever grow, and the worker picks up each new tier
    assert!(sizes.windows(2).all(|pair| pair[0] <= pair[1]));
    let largest = sizes.iter().copied().max().unwrap_or(0);
    assert!(largest >= BufferTier::Medium.size(), "sizes reached {}", largest);
    assert!(largest <= test.send_buffer().tier().size());
}
