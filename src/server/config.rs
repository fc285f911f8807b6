//! Wire session configuration
//!
//! The operator delivers a JSON object between a pair of config markers.
//! Validation collects every failure into one aggregated diagnostic and
//! produces a [`SessionConfig`] only when the whole object checks out, so
//! a bad reconfiguration can never leave a half-built session behind.

use crate::capture::{SourceDescriptor, SourceKind};
use serde_json::Value;
use thiserror::Error;

/// A single validation failure in a wire config
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("expected value for \"{0}\", got none")]
    MissingField(&'static str),

    #[error("value for \"{name}\" must be between 1 and 65535, got {value}")]
    OutOfRange { name: &'static str, value: i64 },

    #[error("expected \"ip_camera\", \"webcam\", or \"default\" for \"videoType\", got {0}")]
    UnknownVideoType(String),

    #[error("invalid uri for value \"videoSource\": {0}")]
    InvalidUri(String),

    #[error("invalid device path for value \"videoSource\": {0}")]
    MissingDevice(String),

    #[error("connection still running, stop the video before reconfiguring the server")]
    SessionActive,
}

/// Join accumulated validation failures into one operator diagnostic.
pub fn aggregate(errors: &[ConfigError]) -> String {
    errors
        .iter()
        .map(|e| format!("Error: {e}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// A fully validated session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Bounce (or proxy) server host
    pub host: String,
    /// Bounce (or proxy) server port
    pub port: u16,
    /// When set, tunnel through an HTTP proxy to this local port
    pub internal_port: Option<u16>,
    /// Wrap the relay transport in TLS
    pub tls_enabled: bool,
    /// The validated video source
    pub source: SourceDescriptor,
}

impl SessionConfig {
    /// Parse and validate the config text captured from the operator.
    ///
    /// Every failure is collected; the result is Ok only when the whole
    /// object validated.
    pub fn parse(text: &str) -> Result<Self, Vec<ConfigError>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| vec![ConfigError::InvalidJson(e.to_string())])?;
        let Some(obj) = value.as_object() else {
            return Err(vec![ConfigError::InvalidJson(
                "expected a JSON object".to_string(),
            )]);
        };

        let mut errors = Vec::new();

        let host = match obj.get("host").and_then(Value::as_str) {
            Some(host) => Some(host.to_string()),
            None => {
                errors.push(ConfigError::MissingField("host"));
                None
            }
        };
        let port = required_port(obj, "port", &mut errors);
        let internal_port = optional_port(obj, "internalPort", &mut errors);
        let tls_enabled = obj
            .get("enableSSL")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let h264_encoded = obj
            .get("h264Encoded")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let source = validate_source(obj, h264_encoded, &mut errors);

        if !errors.is_empty() {
            return Err(errors);
        }

        // All Options are Some here: any None pushed an error above.
        Ok(Self {
            host: host.unwrap_or_default(),
            port: port.unwrap_or_default(),
            internal_port,
            tls_enabled,
            source: source.unwrap_or(SourceDescriptor {
                kind: SourceKind::Default,
                source: String::new(),
                h264_encoded,
            }),
        })
    }
}

fn port_in_range(name: &'static str, value: i64, errors: &mut Vec<ConfigError>) -> Option<u16> {
    if (1..=65535).contains(&value) {
        Some(value as u16)
    } else {
        errors.push(ConfigError::OutOfRange { name, value });
        None
    }
}

fn required_port(
    obj: &serde_json::Map<String, Value>,
    name: &'static str,
    errors: &mut Vec<ConfigError>,
) -> Option<u16> {
    match obj.get(name).and_then(Value::as_i64) {
        Some(value) => port_in_range(name, value, errors),
        None => {
            errors.push(ConfigError::MissingField(name));
            None
        }
    }
}

fn optional_port(
    obj: &serde_json::Map<String, Value>,
    name: &'static str,
    errors: &mut Vec<ConfigError>,
) -> Option<u16> {
    match obj.get(name).and_then(Value::as_i64) {
        Some(value) => port_in_range(name, value, errors),
        None => None,
    }
}

/// Resolve the video source fields.
///
/// A present `tcpSourcePort` short-circuits `videoType` handling and
/// configures a direct TCP source; `videoSource` then names the source
/// host, defaulting to loopback.
fn validate_source(
    obj: &serde_json::Map<String, Value>,
    h264_encoded: bool,
    errors: &mut Vec<ConfigError>,
) -> Option<SourceDescriptor> {
    let video_source = obj.get("videoSource").and_then(Value::as_str);

    if obj.get("tcpSourcePort").is_some() {
        let port = match obj.get("tcpSourcePort").and_then(Value::as_i64) {
            Some(value) => port_in_range("tcpSourcePort", value, errors)?,
            None => {
                errors.push(ConfigError::MissingField("tcpSourcePort"));
                return None;
            }
        };
        let host = video_source.unwrap_or("127.0.0.1");
        return Some(SourceDescriptor {
            kind: SourceKind::TcpSource,
            source: format!("{host}:{port}"),
            h264_encoded,
        });
    }

    let Some(video_type) = obj.get("videoType").and_then(Value::as_str) else {
        errors.push(ConfigError::MissingField("videoType"));
        return None;
    };

    match video_type {
        "ip_camera" => {
            let Some(source) = video_source else {
                errors.push(ConfigError::MissingField("videoSource"));
                return None;
            };
            if let Err(e) = url::Url::parse(source) {
                errors.push(ConfigError::InvalidUri(e.to_string()));
                return None;
            }
            Some(SourceDescriptor {
                kind: SourceKind::IpCamera,
                source: source.to_string(),
                h264_encoded,
            })
        }
        "webcam" => {
            let Some(source) = video_source else {
                errors.push(ConfigError::MissingField("videoSource"));
                return None;
            };
            if !std::path::Path::new(source).exists() {
                errors.push(ConfigError::MissingDevice(source.to_string()));
                return None;
            }
            Some(SourceDescriptor {
                kind: SourceKind::Webcam,
                source: source.to_string(),
                h264_encoded,
            })
        }
        "default" => Some(SourceDescriptor {
            kind: SourceKind::Default,
            source: String::new(),
            h264_encoded,
        }),
        other => {
            errors.push(ConfigError::UnknownVideoType(other.to_string()));
            None
        }
    }
}
