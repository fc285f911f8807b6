//! Integration tests for camlink
//!
//! Drives the whole stack over loopback sockets: a fake bounce server
//! grants channels, a fake HTTP proxy fronts it, a scripted capture
//! backend stands in for the media pipeline, and a raw TcpStream plays
//! the operator.

use camlink::capture::{
    CaptureError, CaptureHandle, CaptureService, FrameSink, SourceDescriptor, StartedCapture,
};
use camlink::config::RelayConfig;
use camlink::protocol::markers;
use camlink::server::ControlServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Capture backend that reports streaming until stopped and remembers the
/// state of the last handle it hands out.
#[derive(Default)]
struct MockCapture {
    last_stream: Mutex<Option<Arc<AtomicBool>>>,
}

struct MockHandle {
    streaming: Arc<AtomicBool>,
}

impl CaptureHandle for MockHandle {
    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.streaming.store(false, Ordering::Release);
    }
}

impl CaptureService for MockCapture {
    fn start(
        &self,
        _descriptor: &SourceDescriptor,
        _sink: Arc<dyn FrameSink>,
    ) -> Result<StartedCapture, CaptureError> {
        let streaming = Arc::new(AtomicBool::new(true));
        *self.last_stream.lock().unwrap() = Some(streaming.clone());
        let (_tx, events) = mpsc::channel(1);
        Ok(StartedCapture {
            handle: Box::new(MockHandle { streaming }),
            events,
        })
    }
}

/// Spawn a control server on an ephemeral port and return the port.
async fn start_server(capture: Arc<dyn CaptureService>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = RelayConfig {
        auth_message: "hi".to_string(),
        channel: Some(2),
    };
    let server = Arc::new(ControlServer::new(capture, relay));
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    port
}

/// Fake bounce server: grants the channel to one client, then holds the
/// socket open until the client hangs up.
async fn start_bounce_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"4-v2.1\r\n").await.unwrap();

        // Auth token "hi" plus the 4-digit channel claim.
        let mut claim = [0u8; 6];
        socket.read_exact(&mut claim).await.unwrap();
        assert_eq!(&claim, b"hi0002");

        socket.write_all(b"READY\r\n").await.unwrap();

        let mut buf = [0u8; 4096];
        while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
    });
    port
}

async fn connect_operator(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

async fn send_config(stream: &mut TcpStream, json: &str) {
    let mut frame = vec![markers::CONFIG];
    frame.extend_from_slice(json.as_bytes());
    frame.push(markers::CONFIG);
    stream.write_all(&frame).await.unwrap();
}

async fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut b = [0u8; 1];
    loop {
        stream.read_exact(&mut b).await.unwrap();
        if b[0] == b'\n' {
            break;
        }
        line.push(b[0]);
    }
    String::from_utf8(line).unwrap()
}

/// Read and discard until `marker`, returning the bytes that preceded it.
async fn read_until_byte(stream: &mut TcpStream, marker: u8) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut b = [0u8; 1];
    loop {
        stream.read_exact(&mut b).await.unwrap();
        if b[0] == marker {
            return collected;
        }
        collected.push(b[0]);
    }
}

/// Read the next ping response frame, skipping any diagnostic lines still
/// in flight, and parse its JSON payload.
async fn read_ping(stream: &mut TcpStream) -> serde_json::Value {
    read_until_byte(stream, markers::PING_RESPONSE).await;
    let payload = read_until_byte(stream, markers::PING_RESPONSE).await;
    serde_json::from_slice(&payload).unwrap()
}

async fn expect_config_ack(stream: &mut TcpStream) {
    let mut b = [0u8; 1];
    stream.read_exact(&mut b).await.unwrap();
    assert_eq!(b[0], markers::CONFIG);
    assert_eq!(read_line(stream).await, "Success: video server configured");
}

#[tokio::test]
async fn test_ping_without_configuration() {
    let port = start_server(Arc::new(MockCapture::default())).await;
    let mut operator = connect_operator(port).await;

    operator.write_all(&[markers::PING_REQUEST]).await.unwrap();

    // Nothing was sent before the ping, so the frame must start
    // immediately with the response marker.
    let mut b = [0u8; 1];
    operator.read_exact(&mut b).await.unwrap();
    assert_eq!(b[0], markers::PING_RESPONSE);
    let payload = read_until_byte(&mut operator, markers::PING_RESPONSE).await;

    let status: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(status["isConnected"], false);
    assert_eq!(status["connectionAttempted"], false);
    assert_eq!(status["isStreaming"], false);
}

#[tokio::test]
async fn test_configure_reports_aggregated_errors() {
    let port = start_server(Arc::new(MockCapture::default())).await;
    let mut operator = connect_operator(port).await;

    send_config(&mut operator, "{}").await;

    let mut diagnostics = Vec::new();
    for _ in 0..3 {
        diagnostics.push(read_line(&mut operator).await);
    }
    let joined = diagnostics.join("\n");
    assert!(joined.contains("\"host\""));
    assert!(joined.contains("\"port\""));
    assert!(joined.contains("\"videoType\""));
    assert!(diagnostics.iter().all(|line| line.starts_with("Error: ")));

    // No session was created.
    operator.write_all(&[markers::PING_REQUEST]).await.unwrap();
    let status = read_ping(&mut operator).await;
    assert_eq!(status["isConnected"], false);
}

#[tokio::test]
async fn test_start_before_configure() {
    let port = start_server(Arc::new(MockCapture::default())).await;
    let mut operator = connect_operator(port).await;

    operator.write_all(&[markers::START_VIDEO]).await.unwrap();
    assert_eq!(
        read_line(&mut operator).await,
        "Error: request to start video before configuration received"
    );
}

#[tokio::test]
async fn test_full_session_lifecycle() {
    let capture = Arc::new(MockCapture::default());
    let port = start_server(capture.clone()).await;
    let bounce_port = start_bounce_server().await;
    let mut operator = connect_operator(port).await;

    let config = format!(
        r#"{{"host":"127.0.0.1","port":{bounce_port},"videoType":"default"}}"#
    );
    send_config(&mut operator, &config).await;
    expect_config_ack(&mut operator).await;

    operator.write_all(&[markers::START_VIDEO]).await.unwrap();
    assert_eq!(
        read_line(&mut operator).await,
        "Info: successfully connected to server"
    );
    assert_eq!(read_line(&mut operator).await, "Success: video server started");
    assert_eq!(read_line(&mut operator).await, "Info: starting video attempted");

    operator.write_all(&[markers::PING_REQUEST]).await.unwrap();
    let status = read_ping(&mut operator).await;
    assert_eq!(status["isConnected"], true);
    assert_eq!(status["connectionAttempted"], true);
    assert_eq!(status["isStreaming"], true);

    // Reconfiguring a connected session is rejected without touching it.
    send_config(&mut operator, &config).await;
    assert_eq!(
        read_line(&mut operator).await,
        "Error: connection still running, stop the video before reconfiguring the server"
    );

    operator.write_all(&[markers::STOP_VIDEO]).await.unwrap();
    let preceding = read_until_byte(&mut operator, markers::STOP_VIDEO).await;
    let text = String::from_utf8_lossy(&preceding);
    assert!(text.contains("Info: video stream stopped"));

    operator.write_all(&[markers::PING_REQUEST]).await.unwrap();
    let status = read_ping(&mut operator).await;
    assert_eq!(status["isConnected"], false);
    assert_eq!(status["isStreaming"], false);
    assert_eq!(status["connectionAttempted"], true);
}

#[tokio::test]
async fn test_start_failure_is_reported_and_recoverable() {
    let port = start_server(Arc::new(MockCapture::default())).await;
    let mut operator = connect_operator(port).await;

    // Port 1 on loopback refuses connections.
    send_config(
        &mut operator,
        r#"{"host":"127.0.0.1","port":1,"videoType":"default"}"#,
    )
    .await;
    expect_config_ack(&mut operator).await;

    operator.write_all(&[markers::START_VIDEO]).await.unwrap();
    assert!(read_line(&mut operator)
        .await
        .starts_with("Error: failed to connect to server"));
    assert_eq!(read_line(&mut operator).await, "Info: starting video attempted");

    // The operator connection is still serviceable.
    operator.write_all(&[markers::PING_REQUEST]).await.unwrap();
    let status = read_ping(&mut operator).await;
    assert_eq!(status["isConnected"], false);
    assert_eq!(status["connectionAttempted"], true);
}

#[tokio::test]
async fn test_proxy_tunnel_path() {
    let capture = Arc::new(MockCapture::default());
    let port = start_server(capture).await;

    // Fake proxy: checks the CONNECT request, then turns into the bounce
    // server behind it.
    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = proxy.accept().await.unwrap();

        let mut request = Vec::new();
        let mut b = [0u8; 1];
        while !request.ends_with(b"\r\n\r\n") {
            socket.read_exact(&mut b).await.unwrap();
            request.push(b[0]);
        }
        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("CONNECT 127.0.0.1:1111 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Connection: Keep-Alive"));

        socket
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();
        socket.write_all(b"4-v2.1\r\n").await.unwrap();
        let mut claim = [0u8; 6];
        socket.read_exact(&mut claim).await.unwrap();
        assert_eq!(&claim, b"hi0002");
        socket.write_all(b"READY\r\n").await.unwrap();

        let mut buf = [0u8; 4096];
        while socket.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let mut operator = connect_operator(port).await;
    let config = format!(
        r#"{{"host":"127.0.0.1","port":{proxy_port},"internalPort":1111,"videoType":"default"}}"#
    );
    send_config(&mut operator, &config).await;
    expect_config_ack(&mut operator).await;

    operator.write_all(&[markers::START_VIDEO]).await.unwrap();
    assert_eq!(
        read_line(&mut operator).await,
        "Info: successfully connected to server"
    );
}

#[tokio::test]
async fn test_rejected_proxy_fails_connect() {
    let port = start_server(Arc::new(MockCapture::default())).await;

    let proxy = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_port = proxy.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = proxy.accept().await.unwrap();
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .await
            .unwrap();
    });

    let mut operator = connect_operator(port).await;
    let config = format!(
        r#"{{"host":"127.0.0.1","port":{proxy_port},"internalPort":1111,"videoType":"default"}}"#
    );
    send_config(&mut operator, &config).await;
    expect_config_ack(&mut operator).await;

    operator.write_all(&[markers::START_VIDEO]).await.unwrap();
    let line = read_line(&mut operator).await;
    assert!(line.starts_with("Error: failed to connect to server"));
    assert!(line.contains("403"));
}

#[tokio::test]
async fn test_operator_disconnect_stops_video() {
    let capture = Arc::new(MockCapture::default());
    let port = start_server(capture.clone()).await;
    let bounce_port = start_bounce_server().await;

    let mut operator = connect_operator(port).await;
    let config = format!(
        r#"{{"host":"127.0.0.1","port":{bounce_port},"videoType":"default"}}"#
    );
    send_config(&mut operator, &config).await;
    expect_config_ack(&mut operator).await;

    operator.write_all(&[markers::START_VIDEO]).await.unwrap();
    assert_eq!(
        read_line(&mut operator).await,
        "Info: successfully connected to server"
    );

    // The capture starts shortly after the connect confirmation.
    let streaming = {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(streaming) = capture.last_stream.lock().unwrap().clone() {
                break streaming;
            }
            assert!(waited < Duration::from_secs(10), "capture was never started");
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += Duration::from_millis(50);
        }
    };
    assert!(streaming.load(Ordering::Acquire));

    drop(operator);

    // The server notices the hangup and runs stop on its own.
    let mut waited = Duration::ZERO;
    while streaming.load(Ordering::Acquire) {
        assert!(waited < Duration::from_secs(10), "capture was never stopped");
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }
}
