//! Marker-byte control framing
//!
//! Operator bytes carry no length prefixes; a handful of marker bytes
//! delimit commands, and config JSON travels between a pair of config
//! markers. The state machine here is pure so it can be fed arbitrary
//! read fragments.

use crate::protocol::markers;

/// A decoded operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Config JSON captured between the config markers
    Configure(String),
    StartVideo,
    StopVideo,
    Ping,
}

/// Per-operator-connection framing state
#[derive(Debug, Default)]
pub struct ControlSession {
    reading_config: bool,
    config_buffer: Vec<u8>,
}

impl ControlSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one read fragment, byte by byte, in arrival order.
    /// Bytes that are neither a known marker nor config payload are
    /// dropped; they belong to the reserved motion channel.
    pub fn feed(&mut self, data: &[u8]) -> Vec<ControlCommand> {
        let mut commands = Vec::new();
        for &b in data {
            if self.reading_config {
                if b == markers::CONFIG {
                    self.reading_config = false;
                    // One char per byte, not UTF-8: config bytes map
                    // straight onto their Latin-1 code points.
                    let text: String = self.config_buffer.iter().map(|&b| b as char).collect();
                    self.config_buffer.clear();
                    commands.push(ControlCommand::Configure(text));
                } else {
                    self.config_buffer.push(b);
                }
                continue;
            }
            match b {
                markers::CONFIG => {
                    self.reading_config = true;
                    self.config_buffer.clear();
                }
                markers::START_VIDEO => commands.push(ControlCommand::StartVideo),
                markers::STOP_VIDEO => commands.push(ControlCommand::StopVideo),
                markers::PING_REQUEST => commands.push(ControlCommand::Ping),
                _ => {}
            }
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_captured_between_markers() {
        let mut session = ControlSession::new();
        let mut data = vec![markers::CONFIG];
        data.extend_from_slice(b"{\"host\":\"h\"}");
        data.push(markers::CONFIG);

        let commands = session.feed(&data);
        assert_eq!(
            commands,
            vec![ControlCommand::Configure("{\"host\":\"h\"}".to_string())]
        );
    }

    #[test]
    fn test_config_split_across_reads() {
        let mut session = ControlSession::new();
        assert!(session.feed(&[markers::CONFIG, b'{']).is_empty());
        assert!(session.feed(b"}").is_empty());
        let commands = session.feed(&[markers::CONFIG]);
        assert_eq!(commands, vec![ControlCommand::Configure("{}".to_string())]);
    }

    #[test]
    fn test_marker_bytes_inside_config_are_payload() {
        // Start/stop markers lose their meaning during config capture,
        // and each payload byte becomes exactly one character.
        let mut session = ControlSession::new();
        let data = [
            markers::CONFIG,
            markers::START_VIDEO,
            markers::STOP_VIDEO,
            markers::CONFIG,
        ];
        let commands = session.feed(&data);
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            ControlCommand::Configure(text) => {
                assert_eq!(text.chars().count(), 2);
                assert_eq!(text, "\u{4b}\u{a7}");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_markers() {
        let mut session = ControlSession::new();
        let commands = session.feed(&[
            markers::START_VIDEO,
            markers::PING_REQUEST,
            markers::STOP_VIDEO,
        ]);
        assert_eq!(
            commands,
            vec![
                ControlCommand::StartVideo,
                ControlCommand::Ping,
                ControlCommand::StopVideo,
            ]
        );
    }

    #[test]
    fn test_unknown_bytes_ignored() {
        let mut session = ControlSession::new();
        assert!(session.feed(&[markers::JOG, markers::AXIS, 0x01]).is_empty());
    }

    #[test]
    fn test_restarted_config_resets_buffer() {
        let mut session = ControlSession::new();
        session.feed(&[markers::CONFIG]);
        session.feed(b"partial");
        // A fault handler may re-enter config mode; feed terminates the
        // first capture, then starts a clean one.
        let commands = session.feed(&[markers::CONFIG, markers::CONFIG, b'x', markers::CONFIG]);
        assert_eq!(
            commands,
            vec![
                ControlCommand::Configure("partial".to_string()),
                ControlCommand::Configure("x".to_string()),
            ]
        );
    }
}
