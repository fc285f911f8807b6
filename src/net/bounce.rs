//! Bounce-server handshake layer
//!
//! The bounce server multiplexes several client channels behind one port.
//! Before traffic flows it sends a version line advertising the hex field
//! width of the channel id, expects the client's authentication token and
//! channel claim, and answers with a status line. Only a literal `READY`
//! grants the channel.

use super::layer::{HandshakeLayer, LayerEvent, LayerOutput};
use super::HandshakeError;
use bytes::{Bytes, BytesMut};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitVersion,
    AwaitStatus,
    Done,
}

/// Handshake layer for the bounce-server channel negotiation
pub struct BounceHandshakeLayer {
    phase: Phase,
    line_buffer: BytesMut,
    auth_message: Option<String>,
    channel: Option<u32>,
}

impl BounceHandshakeLayer {
    /// `channel` of `None` claims no channel; the hex reply is omitted.
    pub fn new(auth_message: Option<String>, channel: Option<u32>) -> Self {
        Self {
            phase: Phase::AwaitVersion,
            line_buffer: BytesMut::new(),
            auth_message,
            channel,
        }
    }

    /// Take one `\n`-terminated line out of the buffer, trimmed of CR/LF.
    fn take_line(&mut self) -> Option<String> {
        let end = self.line_buffer.iter().position(|&b| b == b'\n')?;
        let line = self.line_buffer.split_to(end + 1);
        Some(
            String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string(),
        )
    }

    /// Parse `<digits>-<anything>`, returning the hex field width.
    fn parse_version_line(line: &str) -> Option<usize> {
        let (digits, _) = line.split_once('-')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }

    fn handle_version_line(&mut self, line: String, out: &mut LayerOutput) {
        let Some(width) = Self::parse_version_line(&line) else {
            out.fail(HandshakeError::MalformedVersionLine(line));
            return;
        };
        debug!(version = %line, width, "bounce server version received");

        if let Some(auth) = &self.auth_message {
            out.write(Bytes::from(auth.clone()));
        }
        if let Some(channel) = self.channel {
            out.write(Bytes::from(format!("{channel:0width$x}")));
        }
        self.phase = Phase::AwaitStatus;
    }

    fn handle_status_line(&mut self, line: String, out: &mut LayerOutput) {
        if line == "READY" {
            debug!("bounce server channel granted");
            self.phase = Phase::Done;
            out.forward(LayerEvent::Active);
            if !self.line_buffer.is_empty() {
                let leftover = self.line_buffer.split().freeze();
                out.forward(LayerEvent::Read(leftover));
            }
        } else {
            out.fail(HandshakeError::Rejected(line));
        }
    }
}

impl HandshakeLayer for BounceHandshakeLayer {
    fn on_event(&mut self, event: LayerEvent, out: &mut LayerOutput) {
        if self.phase == Phase::Done {
            out.forward(event);
            return;
        }

        match event {
            // Downstream activation waits for READY.
            LayerEvent::Active => {}
            LayerEvent::Read(data) => {
                self.line_buffer.extend_from_slice(&data);
                while self.phase != Phase::Done && out.failure.is_none() {
                    let Some(line) = self.take_line() else {
                        break;
                    };
                    match self.phase {
                        Phase::AwaitVersion => self.handle_version_line(line, out),
                        Phase::AwaitStatus => self.handle_status_line(line, out),
                        Phase::Done => unreachable!(),
                    }
                }
            }
            LayerEvent::Inactive => out.forward(LayerEvent::Inactive),
        }
    }
}
