//! HTTP CONNECT proxy tunnel layer
//!
//! On activation, asks the proxy to open a raw tunnel to the relay's
//! internal port and holds back the rest of the pipeline until the proxy's
//! HTTP response terminates. State is scoped to one connection attempt.

use super::layer::{HandshakeLayer, LayerEvent, LayerOutput};
use super::ProxyError;
use bytes::Bytes;
use tracing::debug;

/// Handshake layer that establishes an HTTP CONNECT tunnel
pub struct ProxyTunnelLayer {
    host: String,
    internal_port: u16,
    response: String,
    /// Consecutive CR-LF pairs seen; two mark end-of-headers
    terminator_run: u8,
    last_byte: u8,
    established: bool,
}

impl ProxyTunnelLayer {
    pub fn new(host: impl Into<String>, internal_port: u16) -> Self {
        Self {
            host: host.into(),
            internal_port,
            response: String::new(),
            terminator_run: 0,
            last_byte: 0,
            established: false,
        }
    }

    fn connect_request(&self) -> Bytes {
        let target = format!("{}:{}", self.host, self.internal_port);
        Bytes::from(format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
        ))
    }

    /// Scan `data`, accumulating response text until two consecutive CR-LF
    /// pairs; returns the index just past the header terminator.
    fn scan(&mut self, data: &[u8]) -> Option<usize> {
        for (i, &b) in data.iter().enumerate() {
            if b == b'\n' && self.last_byte == b'\r' {
                self.terminator_run += 1;
            }
            if b != b'\n' && b != b'\r' {
                self.terminator_run = 0;
            }
            self.response.push(b as char);
            self.last_byte = b;

            if self.terminator_run >= 2 {
                return Some(i + 1);
            }
        }
        None
    }
}

impl HandshakeLayer for ProxyTunnelLayer {
    fn on_event(&mut self, event: LayerEvent, out: &mut LayerOutput) {
        if self.established {
            out.forward(event);
            return;
        }

        match event {
            LayerEvent::Active => {
                debug!(host = %self.host, port = self.internal_port, "requesting proxy tunnel");
                out.write(self.connect_request());
            }
            LayerEvent::Read(data) => {
                let Some(end) = self.scan(&data) else {
                    // Header terminator not reached yet, keep accumulating.
                    return;
                };
                if self.response.contains("200") {
                    debug!("proxy tunnel established");
                    self.established = true;
                    out.forward(LayerEvent::Active);
                    if end < data.len() {
                        // Bytes already read past the header boundary belong
                        // to the next layer.
                        out.forward(LayerEvent::Read(data.slice(end..)));
                    }
                } else {
                    out.fail(ProxyError::Rejected(self.response.clone()));
                }
            }
            LayerEvent::Inactive => {
                out.fail(ProxyError::MalformedResponse);
            }
        }
    }
}
