//! # Camlink
//!
//! A remote-control protocol stack for a teleoperated camera/video relay.
//!
//! An operator-facing control server accepts connections and drives a
//! managed session that itself connects outward to a relay ("bounce")
//! server, optionally through an HTTP CONNECT proxy tunnel and/or a TLS
//! layer, performing a version-negotiated handshake before a dedicated
//! channel is granted and the link is declared ready.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Control Server                      │
//! │     (operator connections, marker-byte framing)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Managed Session                     │
//! │     (validated config, capture-service handle)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Tunneling Client                    │
//! │    (proxy tunnel, bounce handshake, ready signal)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Connection                          │
//! │           (TCP, optional TLS wrapping)               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod net;
pub mod protocol;
pub mod server;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default control server port
pub const DEFAULT_CONTROL_PORT: u16 = 32565;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Net(#[from] net::NetError),

    #[error("Session config error: {0}")]
    Config(#[from] server::ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] server::SessionError),

    #[error("Capture error: {0}")]
    Capture(#[from] capture::CaptureError),

    #[error("Configuration error: {0}")]
    FileConfig(String),
}
