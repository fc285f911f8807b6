//! Outbound relay connection
//!
//! A [`Connection`] exclusively owns one outbound transport endpoint: a TCP
//! stream, optionally wrapped in a TLS client handshake with a trust-all
//! policy. Opening it yields a stream of [`LayerEvent`]s driven by a reader
//! task; writes go through a writer task so the connection can be shared by
//! handle. State transitions are published on a watch channel.

use super::layer::LayerEvent;
use super::{tls, NetError};
use crate::protocol::CONNECT_TIMEOUT;
use bytes::Bytes;
use rustls::pki_types::ServerName;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never opened
    Idle,
    /// Transport connect or TLS handshake in progress
    Connecting,
    /// Transport established
    Active,
    /// Transport gone, by fault or by user close
    Closed,
}

/// Reason text recorded for a user-initiated close
const USER_CLOSE_REASON: &str = "closed by user";

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// An outbound transport endpoint with optional TLS wrapping
pub struct Connection {
    host: String,
    port: u16,
    tls_enabled: bool,
    state: watch::Sender<ConnectionState>,
    close_reason: Arc<Mutex<Option<String>>>,
    writer: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
    shutdown: Arc<Notify>,
    user_closed: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(host: impl Into<String>, port: u16, tls_enabled: bool) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            host: host.into(),
            port,
            tls_enabled,
            state,
            close_reason: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
            user_closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Establish the transport.
    ///
    /// On success the connection is Active and the returned receiver yields
    /// the inbound event stream: one `Active`, any number of `Read`s, then
    /// one `Inactive` when the transport goes away.
    pub async fn open(&self) -> Result<mpsc::Receiver<LayerEvent>, NetError> {
        self.state.send_replace(ConnectionState::Connecting);
        self.user_closed.store(false, Ordering::SeqCst);
        *self.close_reason.lock().unwrap() = None;

        let stream = match self.connect_transport().await {
            Ok(stream) => stream,
            Err(err) => {
                *self.close_reason.lock().unwrap() = Some(err.to_string());
                self.state.send_replace(ConnectionState::Closed);
                return Err(err);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let (event_tx, event_rx) = mpsc::channel::<LayerEvent>(64);
        let (write_tx, write_rx) = mpsc::channel::<Bytes>(256);

        *self.writer.lock().unwrap() = Some(write_tx);
        self.state.send_replace(ConnectionState::Active);
        debug!(host = %self.host, port = self.port, tls = self.tls_enabled, "transport active");

        // Delivered ahead of any reads; the reader task only ever appends.
        let _ = event_tx.send(LayerEvent::Active).await;

        tokio::spawn(write_loop(write_rx, write_half));
        tokio::spawn(read_loop(
            read_half,
            event_tx,
            self.state.clone(),
            self.close_reason.clone(),
            self.writer.clone(),
            self.shutdown.clone(),
            self.user_closed.clone(),
        ));

        Ok(event_rx)
    }

    async fn connect_transport(&self) -> Result<Box<dyn AsyncStream>, NetError> {
        let addr = format!("{}:{}", self.host, self.port);
        let timeout = Duration::from_secs(CONNECT_TIMEOUT);

        let tcp = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Refused(e.to_string()))?;
        tcp.set_nodelay(true).ok();

        if !self.tls_enabled {
            return Ok(Box::new(tcp));
        }

        let connector = TlsConnector::from(Arc::new(tls::trust_all_config()));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| NetError::Tls(format!("invalid server name: {e}")))?;

        let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
            .await
            .map_err(|_| NetError::Timeout)?
            .map_err(|e| NetError::Tls(e.to_string()))?;

        Ok(Box::new(stream))
    }

    /// Write bytes to the transport. No-op when inactive or backpressured.
    pub fn write(&self, data: Bytes) {
        if !self.is_active() {
            trace!("dropping write to non-active connection");
            return;
        }
        if let Some(tx) = self.writer.lock().unwrap().as_ref() {
            if tx.try_send(data).is_err() {
                warn!("outbound buffer full, dropping write");
            }
        }
    }

    /// Close the transport; bounded wait for the reader task to wind down.
    pub async fn close(&self) {
        if *self.state.borrow() != ConnectionState::Active {
            return;
        }
        self.user_closed.store(true, Ordering::SeqCst);
        self.writer.lock().unwrap().take();
        self.shutdown.notify_waiters();

        let mut rx = self.state.subscribe();
        let closed = async {
            while *rx.borrow_and_update() != ConnectionState::Closed {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(Duration::from_secs(CONNECT_TIMEOUT), closed).await;
    }

    pub fn is_active(&self) -> bool {
        *self.state.borrow() == ConnectionState::Active
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribe to state transitions
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Why the connection closed: the triggering fault, or
    /// "closed by user" for a user-initiated close. None while active or
    /// after a clean remote close.
    pub fn last_close_reason(&self) -> Option<String> {
        self.close_reason.lock().unwrap().clone()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

async fn write_loop(
    mut write_rx: mpsc::Receiver<Bytes>,
    mut write_half: impl AsyncWrite + Unpin,
) {
    while let Some(data) = write_rx.recv().await {
        if let Err(e) = write_half.write_all(&data).await {
            debug!("write failed: {e}");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

#[allow(clippy::too_many_arguments)]
async fn read_loop(
    mut read_half: impl AsyncRead + Unpin,
    event_tx: mpsc::Sender<LayerEvent>,
    state: watch::Sender<ConnectionState>,
    close_reason: Arc<Mutex<Option<String>>>,
    writer: Arc<Mutex<Option<mpsc::Sender<Bytes>>>>,
    shutdown: Arc<Notify>,
    user_closed: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 8192];
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let data = Bytes::copy_from_slice(&buf[..n]);
                    if event_tx.send(LayerEvent::Read(data)).await.is_err() {
                        // Nobody is driving the layer stack anymore.
                        break;
                    }
                }
                Err(e) => {
                    close_reason.lock().unwrap().get_or_insert(e.to_string());
                    break;
                }
            },
        }
    }

    if user_closed.load(Ordering::SeqCst) {
        close_reason
            .lock()
            .unwrap()
            .get_or_insert(USER_CLOSE_REASON.to_string());
    }

    // Dropping the writer handle ends the write loop and closes the socket.
    writer.lock().unwrap().take();
    state.send_replace(ConnectionState::Closed);
    debug!(reason = ?close_reason.lock().unwrap(), "transport closed");
    let _ = event_tx.send(LayerEvent::Inactive).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_emits_active_then_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"hello").await.unwrap();
        });

        let conn = Connection::new("127.0.0.1", addr.port(), false);
        let mut events = conn.open().await.unwrap();

        assert!(matches!(events.recv().await, Some(LayerEvent::Active)));
        assert!(conn.is_active());

        match events.recv().await {
            Some(LayerEvent::Read(data)) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected event: {:?}", other),
        }

        // Server dropped its socket; the stream ends with Inactive.
        assert!(matches!(events.recv().await, Some(LayerEvent::Inactive)));
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_refused_connect_reports_reason() {
        // Port 1 on loopback is almost certainly closed.
        let conn = Connection::new("127.0.0.1", 1, false);
        let err = conn.open().await.unwrap_err();
        assert!(matches!(err, NetError::Refused(_)));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.last_close_reason().is_some());
    }

    #[tokio::test]
    async fn test_user_close_sets_reason() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let conn = Connection::new("127.0.0.1", addr.port(), false);
        let mut events = conn.open().await.unwrap();
        assert!(matches!(events.recv().await, Some(LayerEvent::Active)));

        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.last_close_reason().as_deref(), Some("closed by user"));
        assert!(matches!(events.recv().await, Some(LayerEvent::Inactive)));
        hold.abort();
    }

    #[tokio::test]
    async fn test_write_to_inactive_connection_is_noop() {
        let conn = Connection::new("127.0.0.1", 1, false);
        // Must not panic or block.
        conn.write(Bytes::from_static(b"dropped"));
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn test_write_reaches_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let conn = Connection::new("127.0.0.1", addr.port(), false);
        let mut events = conn.open().await.unwrap();
        assert!(matches!(events.recv().await, Some(LayerEvent::Active)));

        conn.write(Bytes::from_static(b"frame"));
        assert_eq!(&server.await.unwrap(), b"frame");
    }
}
