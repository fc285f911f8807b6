//! Operator-facing control server
//!
//! Accepts any number of operator connections, each with its own framing
//! [`ControlSession`], all sharing one managed-session slot. Two locks keep
//! the slot sane: a `std::sync::Mutex` guards the slot itself so ping can
//! read it without blocking, and a `tokio::sync::Mutex` serializes
//! configure/start/stop so two operators cannot race a reconfigure against
//! a start. Blocking waits run on the requesting operator's task only.

pub mod config;
mod session;

pub use config::{ConfigError, SessionConfig};
pub use session::{ControlCommand, ControlSession};

use crate::capture::{CaptureHandle, CaptureService, FrameSink, StartedCapture};
use crate::config::RelayConfig;
use crate::net::{ClientSettings, TunnelingClient};
use crate::protocol::{markers, StatusReport, CONNECT_TIMEOUT, DISCONNECT_TIMEOUT};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Start/stop misuse; surfaced as a diagnostic, never fatal
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("request to {0} video before configuration received")]
    NotConfigured(&'static str),

    #[error("connection to server already active")]
    AlreadyActive,
}

/// The single configured video session
struct ManagedSession {
    config: SessionConfig,
    client: Arc<TunnelingClient>,
    capture: Option<Box<dyn CaptureHandle>>,
}

/// Sender half of one operator connection.
///
/// Sends are best-effort: once the operator is gone they turn into no-ops,
/// which is exactly what the teardown paths want.
#[derive(Clone)]
struct Operator {
    tx: mpsc::Sender<Bytes>,
}

impl Operator {
    fn send_line(&self, message: impl AsRef<str>) {
        let mut bytes = message.as_ref().as_bytes().to_vec();
        bytes.push(b'\n');
        let _ = self.tx.try_send(Bytes::from(bytes));
    }

    fn send_byte(&self, b: u8) {
        let _ = self.tx.try_send(Bytes::copy_from_slice(&[b]));
    }

    fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.tx.try_send(Bytes::from(frame));
    }

    /// Resolves when the operator connection is gone.
    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Frame sink that feeds captured bytes into the relay link
struct ClientSink {
    client: Arc<TunnelingClient>,
}

impl FrameSink for ClientSink {
    fn write_frame(&self, frame: &[u8]) {
        self.client.write(Bytes::copy_from_slice(frame));
    }
}

/// The operator-facing control server
pub struct ControlServer {
    capture: Arc<dyn CaptureService>,
    relay: RelayConfig,
    /// Managed-session slot; cheap lock, never held across an await
    session: Mutex<Option<ManagedSession>>,
    /// Serializes configure/start/stop across operator connections
    ops: tokio::sync::Mutex<()>,
}

impl ControlServer {
    pub fn new(capture: Arc<dyn CaptureService>, relay: RelayConfig) -> Self {
        Self {
            capture,
            relay,
            session: Mutex::new(None),
            ops: tokio::sync::Mutex::new(()),
        }
    }

    /// Bind the control port and serve operator connections until the
    /// listener fails.
    pub async fn run(self: Arc<Self>, port: u16) -> crate::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "control server listening");
        self.serve(listener).await
    }

    /// Serve operator connections on an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> crate::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                server.handle_operator(stream, peer).await;
            });
        }
    }

    async fn handle_operator(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        debug!(%peer, "operator connected");
        stream.set_nodelay(true).ok();
        let (mut read_half, mut write_half) = stream.into_split();

        let (tx, mut rx) = mpsc::channel::<Bytes>(64);
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        let operator = Operator { tx };
        let mut framing = ControlSession::new();
        let mut buf = [0u8; 4096];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for command in framing.feed(&buf[..n]) {
                        self.dispatch(command, &operator).await;
                    }
                }
                Err(e) => {
                    warn!(%peer, "operator read failed: {e}");
                    break;
                }
            }
        }

        // The operator is gone; release whatever it left running. Only
        // this connection is affected.
        self.stop_video(&operator).await;
        debug!(%peer, "operator disconnected");
    }

    async fn dispatch(&self, command: ControlCommand, operator: &Operator) {
        match command {
            ControlCommand::Configure(text) => self.parse_config(&text, operator).await,
            ControlCommand::StartVideo => self.start_video(operator).await,
            ControlCommand::StopVideo => self.stop_video(operator).await,
            // Ping never takes the ops lock, so it answers even while a
            // start or stop is mid-flight on another connection.
            ControlCommand::Ping => operator.send_frame(self.status().to_frame()),
        }
    }

    /// Current session status; never blocks.
    pub fn status(&self) -> StatusReport {
        let slot = self.session.lock().unwrap();
        match slot.as_ref() {
            None => StatusReport::default(),
            Some(session) => StatusReport {
                is_connected: session.client.is_active(),
                connection_attempted: session.client.connection_attempted(),
                is_streaming: session
                    .capture
                    .as_ref()
                    .map(|h| h.is_streaming())
                    .unwrap_or(false),
            },
        }
    }

    async fn parse_config(&self, text: &str, operator: &Operator) {
        let _ops = self.ops.lock().await;

        if self
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.client.is_active())
            .unwrap_or(false)
        {
            operator.send_line(format!("Error: {}", ConfigError::SessionActive));
            return;
        }

        debug!("parsing session config");
        let config = match SessionConfig::parse(text) {
            Ok(config) => config,
            Err(errors) => {
                // The existing session, if any, is left untouched.
                operator.send_line(config::aggregate(&errors));
                return;
            }
        };

        let mut settings = ClientSettings::new(config.host.clone(), config.port);
        settings.tls_enabled = config.tls_enabled;
        settings.internal_port = config.internal_port;
        settings.channel = self.relay.channel;
        settings.auth_message = Some(self.relay.auth_message.clone());
        let client = Arc::new(TunnelingClient::new(settings));

        info!(host = %config.host, port = config.port, "video session configured");
        *self.session.lock().unwrap() = Some(ManagedSession {
            config,
            client,
            capture: None,
        });

        operator.send_byte(markers::CONFIG);
        operator.send_line("Success: video server configured");
    }

    async fn start_video(&self, operator: &Operator) {
        let _ops = self.ops.lock().await;

        let (client, descriptor) = {
            let slot = self.session.lock().unwrap();
            match slot.as_ref() {
                None => {
                    operator.send_line(format!("Error: {}", SessionError::NotConfigured("start")));
                    return;
                }
                Some(session) => {
                    if session.client.is_active() {
                        // Warn but proceed, matching the control protocol.
                        operator.send_line(format!("Error: {}", SessionError::AlreadyActive));
                    }
                    (session.client.clone(), session.config.source.clone())
                }
            }
        };

        self.connect_and_stream(client, descriptor, operator).await;
        operator.send_line("Info: starting video attempted");
    }

    async fn connect_and_stream(
        &self,
        client: Arc<TunnelingClient>,
        descriptor: crate::capture::SourceDescriptor,
        operator: &Operator,
    ) {
        let result = client.connect(Vec::new());
        let outcome = result
            .wait_timeout(Duration::from_secs(CONNECT_TIMEOUT))
            .await;
        match outcome {
            Some(outcome) if outcome.is_success() => {
                operator.send_line("Info: successfully connected to server");
            }
            other => {
                let reason = match other {
                    Some(crate::net::ConnectOutcome::Failure(err)) => err.to_string(),
                    _ => "timed out".to_string(),
                };
                warn!("relay connect failed: {reason}");
                operator.send_line(format!("Error: failed to connect to server: {reason}"));
                return;
            }
        }

        // Relay the eventual close back to this operator; the subscription
        // dies with the operator connection.
        {
            let client = client.clone();
            let notify = operator.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = client.closed() => {
                        notify.send_line("Info: disconnected from server");
                    }
                    _ = notify.closed() => {}
                }
            });
        }

        let sink = Arc::new(ClientSink {
            client: client.clone(),
        });
        let started = match self.capture.start(&descriptor, sink) {
            Ok(started) => started,
            Err(e) => {
                warn!("capture start failed: {e}");
                operator.send_line(format!("Error: {e}"));
                return;
            }
        };

        let StartedCapture { handle, mut events } = started;
        {
            let notify = operator.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Some(event) => {
                                notify.send_line(format!("{}: {}", event.source, event.message));
                                notify.send_line("Info: video stream stopped");
                            }
                            None => break,
                        },
                        _ = notify.closed() => break,
                    }
                }
            });
        }

        if handle.is_streaming() {
            operator.send_line("Success: video server started");
        }
        if let Some(session) = self.session.lock().unwrap().as_mut() {
            session.capture = Some(handle);
        }
    }

    /// Stop whatever subset of {capture, relay link} is running.
    ///
    /// Idempotent: a second call finds nothing to stop and only re-emits
    /// the final notification.
    async fn stop_video(&self, operator: &Operator) {
        let _ops = self.ops.lock().await;

        let (client, capture) = {
            let mut slot = self.session.lock().unwrap();
            match slot.as_mut() {
                None => {
                    operator.send_line(format!("Error: {}", SessionError::NotConfigured("stop")));
                    return;
                }
                Some(session) => (session.client.clone(), session.capture.take()),
            }
        };

        if let Some(capture) = capture {
            if capture.is_streaming() {
                debug!("stopping capture");
                capture.stop();
            }
        }
        if client.is_active() {
            let _ = tokio::time::timeout(
                Duration::from_secs(DISCONNECT_TIMEOUT),
                client.disconnect(),
            )
            .await;
        }

        operator.send_line("Info: video stream stopped");
        operator.send_byte(markers::STOP_VIDEO);
    }
}
