//! Control-channel protocol definitions and constants

use serde::{Deserialize, Serialize};

/// Marker bytes for the operator control channel.
///
/// Each framing unit starts with one of these bytes; there is no length
/// prefixing. `CONFIG` toggles config capture and doubles as the
/// acknowledgement byte on a successful reconfiguration.
pub mod markers {
    /// Config capture start/end, also the config ack byte
    pub const CONFIG: u8 = 0xfb;
    /// Start the video session
    pub const START_VIDEO: u8 = 0x4b;
    /// Stop the video session
    pub const STOP_VIDEO: u8 = 0xa7;
    /// Status ping request
    pub const PING_REQUEST: u8 = 0x7f;
    /// Status ping response, delimits the JSON payload on both sides
    pub const PING_RESPONSE: u8 = 0x7e;

    // Reserved for the companion motion channel; never dispatched here.
    pub const STOP: u8 = 0x65;
    pub const SPEED: u8 = 0x73;
    pub const JOG: u8 = 0x6a;
    pub const AXIS: u8 = 0x61;
    pub const MSG: u8 = 0x6d;
    pub const ESC_MSG: u8 = 0x00;
}

/// Transport connect timeout in seconds
pub const CONNECT_TIMEOUT: u64 = 30;

/// Bounded wait for a clean disconnect in seconds
pub const DISCONNECT_TIMEOUT: u64 = 5;

/// Fixed size of the outbound frame accumulation buffer
pub const WRITE_BUFFER_SIZE: usize = 256;

/// Payload of a ping response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    /// Whether the managed session's relay connection is active
    pub is_connected: bool,
    /// Whether a connect attempt has been made and completed
    pub connection_attempted: bool,
    /// Whether the capture pipeline is streaming
    pub is_streaming: bool,
}

impl StatusReport {
    /// Frame this report as a ping response: marker byte, JSON, marker byte.
    pub fn to_frame(&self) -> Vec<u8> {
        // StatusReport serialization cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        let mut frame = Vec::with_capacity(json.len() + 2);
        frame.push(markers::PING_RESPONSE);
        frame.extend_from_slice(&json);
        frame.push(markers::PING_RESPONSE);
        frame
    }
}
