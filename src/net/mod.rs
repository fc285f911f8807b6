//! Network layer
//!
//! Provides the outbound side of the relay link:
//! - Connection lifecycle (TCP, optional TLS with a trust-all policy)
//! - Ordered handshake layers (proxy tunnel, bounce-server handshake)
//! - The single-assignment connection result
//! - The tunneling client that composes all of the above

mod bounce;
mod client;
mod connection;
mod layer;
mod proxy;
mod result;
mod tls;

pub use bounce::BounceHandshakeLayer;
pub use client::{ClientSettings, TunnelingClient};
pub use connection::{Connection, ConnectionState};
pub use layer::{HandshakeLayer, LayerEvent, LayerOutput, LayerStack};
pub use proxy::ProxyTunnelLayer;
pub use result::{ConnectOutcome, ConnectionResult};

use thiserror::Error;

/// Network layer errors.
///
/// Variants carry text rather than source errors so outcomes can be cloned
/// into every observer of a [`ConnectionResult`].
#[derive(Debug, Clone, Error)]
pub enum NetError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("TLS failure: {0}")]
    Tls(String),

    #[error("connection closed: {0}")]
    Closed(String),

    #[error("timed out")]
    Timeout,

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// Proxy tunnel errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("did not receive a valid HTTP response from proxy")]
    MalformedResponse,

    #[error("proxy rejected tunnel: {0}")]
    Rejected(String),
}

/// Bounce-server handshake errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("incoherent bounce server version line: {0}")]
    MalformedVersionLine(String),

    #[error("bounce server rejected connection: {0}")]
    Rejected(String),
}
