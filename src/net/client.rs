//! Tunneling client
//!
//! Composes a [`Connection`] with the configured handshake layers and a
//! fixed-size outbound accumulation buffer. `connect` returns immediately
//! with a [`ConnectionResult`] that succeeds only once every layer (proxy
//! tunnel, bounce handshake, ready signal) has passed.

use super::bounce::BounceHandshakeLayer;
use super::connection::{Connection, ConnectionState};
use super::layer::{HandshakeLayer, LayerEvent, LayerOutput, LayerStack};
use super::proxy::ProxyTunnelLayer;
use super::result::ConnectionResult;
use super::NetError;
use crate::protocol::WRITE_BUFFER_SIZE;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Default authentication token presented to the bounce server
const DEFAULT_AUTH_MESSAGE: &str = "hi";

/// Connection knobs for a [`TunnelingClient`]
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Relay server host
    pub host: String,
    /// Relay server port
    pub port: u16,
    /// Wrap the transport in TLS (trust-all policy)
    pub tls_enabled: bool,
    /// When set, tunnel through an HTTP proxy to this local port
    pub internal_port: Option<u16>,
    /// Perform the bounce-server channel negotiation
    pub bounce_protocol: bool,
    /// Channel id claimed on the bounce server; None claims no channel
    pub channel: Option<u32>,
    /// Authentication token sent after the version line
    pub auth_message: Option<String>,
}

impl ClientSettings {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls_enabled: false,
            internal_port: None,
            bounce_protocol: true,
            channel: None,
            auth_message: Some(DEFAULT_AUTH_MESSAGE.to_string()),
        }
    }
}

/// Client for the outbound relay link
pub struct TunnelingClient {
    settings: ClientSettings,
    /// Transport of the current connect attempt. Replaced wholesale on
    /// every connect; a superseded link keeps its own Connection until its
    /// driver task winds down, so its teardown cannot touch the new one.
    connection: Mutex<Arc<Connection>>,
    result: Mutex<Option<ConnectionResult>>,
    active: watch::Sender<bool>,
    write_buffer: Mutex<BytesMut>,
    /// Bumped per connect attempt; gates updates to `active`
    generation: Arc<AtomicU64>,
}

impl TunnelingClient {
    pub fn new(settings: ClientSettings) -> Self {
        let connection = Arc::new(Connection::new(
            settings.host.clone(),
            settings.port,
            settings.tls_enabled,
        ));
        let (active, _) = watch::channel(false);
        Self {
            settings,
            connection: Mutex::new(connection),
            result: Mutex::new(None),
            active,
            write_buffer: Mutex::new(BytesMut::with_capacity(WRITE_BUFFER_SIZE)),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn current_connection(&self) -> Arc<Connection> {
        self.connection.lock().unwrap().clone()
    }

    /// Open the relay link. Returns immediately; the result completes once
    /// every configured layer has succeeded, or on the first failure.
    ///
    /// Each call starts a fresh transport. A still-live previous link is
    /// simply abandoned to its own driver task; only the newest attempt may
    /// update the observable active state.
    pub fn connect(&self, extra_layers: Vec<Box<dyn HandshakeLayer>>) -> ConnectionResult {
        let result = ConnectionResult::new();
        *self.result.lock().unwrap() = Some(result.clone());
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.send_replace(false);

        let connection = Arc::new(Connection::new(
            self.settings.host.clone(),
            self.settings.port,
            self.settings.tls_enabled,
        ));
        *self.connection.lock().unwrap() = connection.clone();

        let mut layers: Vec<Box<dyn HandshakeLayer>> = Vec::new();
        if let Some(internal_port) = self.settings.internal_port {
            layers.push(Box::new(ProxyTunnelLayer::new(
                self.settings.host.clone(),
                internal_port,
            )));
        }
        if self.settings.bounce_protocol {
            layers.push(Box::new(BounceHandshakeLayer::new(
                self.settings.auth_message.clone(),
                self.settings.channel,
            )));
        }
        layers.push(Box::new(ReadySignalLayer {
            result: result.clone(),
            active: self.active.clone(),
            generation,
            current: self.generation.clone(),
        }));
        layers.extend(extra_layers);

        let driver_result = result.clone();
        tokio::spawn(async move {
            drive(connection, LayerStack::new(layers), driver_result).await;
        });

        result
    }

    /// Append one byte to the accumulation buffer, flushing it first when
    /// full. Assumes a single producer.
    pub fn write_byte(&self, b: u8) {
        let connection = self.current_connection();
        let mut buffer = self.write_buffer.lock().unwrap();
        if buffer.len() >= WRITE_BUFFER_SIZE {
            connection.write(buffer.split().freeze());
        }
        buffer.extend_from_slice(&[b]);
    }

    /// Write a whole buffer; any accumulated bytes are flushed first so
    /// byte order is preserved.
    pub fn write(&self, data: Bytes) {
        let connection = self.current_connection();
        let mut buffer = self.write_buffer.lock().unwrap();
        if !buffer.is_empty() {
            connection.write(buffer.split().freeze());
        }
        connection.write(data);
    }

    /// Force an immediate send of the partial accumulation buffer.
    pub fn flush(&self) {
        let connection = self.current_connection();
        let mut buffer = self.write_buffer.lock().unwrap();
        if !buffer.is_empty() {
            connection.write(buffer.split().freeze());
        }
    }

    /// Flush and close the relay link; bounded wait for teardown.
    pub async fn disconnect(&self) {
        self.flush();
        self.current_connection().close().await;
    }

    /// Whether the link is established and ready (all layers passed).
    ///
    /// The transport state is consulted too: a close counts immediately,
    /// before the driver task has processed the inactivation event.
    pub fn is_active(&self) -> bool {
        *self.active.borrow() && self.current_connection().is_active()
    }

    /// Subscription to ready-state changes
    pub fn active_changes(&self) -> watch::Receiver<bool> {
        self.active.subscribe()
    }

    /// Whether a connect attempt has been made and reached an outcome
    pub fn connection_attempted(&self) -> bool {
        self.result
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.is_done())
            .unwrap_or(false)
    }

    /// Result of the most recent connect attempt
    pub fn last_result(&self) -> Option<ConnectionResult> {
        self.result.lock().unwrap().clone()
    }

    /// Await the current transport reaching Closed
    pub async fn closed(&self) {
        let mut rx = self.current_connection().subscribe();
        while *rx.borrow_and_update() != ConnectionState::Closed {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn last_close_reason(&self) -> Option<String> {
        self.current_connection().last_close_reason()
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }
}

/// Pump connection events through the layer stack.
async fn drive(connection: Arc<Connection>, mut stack: LayerStack, result: ConnectionResult) {
    let mut events = match connection.open().await {
        Ok(events) => events,
        Err(err) => {
            result.fail(err);
            return;
        }
    };

    while let Some(event) = events.recv().await {
        let output = stack.dispatch(event);
        for data in output.writes {
            connection.write(data);
        }
        if let Some(err) = output.failure {
            debug!("handshake layer failed: {err}");
            result.fail(err);
            connection.close().await;
            break;
        }
    }

    // The transport is gone; a still-pending result can never succeed.
    let reason = connection
        .last_close_reason()
        .unwrap_or_else(|| "connection closed".to_string());
    result.fail(NetError::Closed(reason));
}

/// Terminal built-in layer: the first activation reaching this point marks
/// the connect attempt successful. Inactivation before success is swallowed
/// (the caller never observed a live link); after success it drops the
/// observable active state and is forwarded.
///
/// The active flag is shared across connect attempts, so only the layer
/// belonging to the newest attempt may touch it; a superseded link still
/// completes its own result but its teardown leaves the flag alone.
struct ReadySignalLayer {
    result: ConnectionResult,
    active: watch::Sender<bool>,
    generation: u64,
    current: Arc<AtomicU64>,
}

impl ReadySignalLayer {
    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}

impl HandshakeLayer for ReadySignalLayer {
    fn on_event(&mut self, event: LayerEvent, out: &mut LayerOutput) {
        match event {
            LayerEvent::Active => {
                if self.result.succeed() && self.is_current() {
                    self.active.send_replace(true);
                }
                out.forward(LayerEvent::Active);
            }
            LayerEvent::Inactive => {
                if self.result.is_success() {
                    if self.is_current() {
                        self.active.send_replace(false);
                    }
                    out.forward(LayerEvent::Inactive);
                }
            }
            LayerEvent::Read(data) => out.forward(LayerEvent::Read(data)),
        }
    }
}
