//! Video capture seam
//!
//! The control server owns configuration and connection lifecycle; actual
//! frame acquisition is behind [`CaptureService`], so the binary can plug
//! in a real grabber while tests run against a scripted one.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Where frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Local webcam device (a device path on this host)
    Webcam,
    /// Network camera reachable by URI
    IpCamera,
    /// Raw TCP listener fed by an external encoder
    TcpSource,
    /// Platform default capture device
    Default,
}

/// A fully validated description of one video source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// Device path, URI, or `host:port` depending on `kind`
    pub source: String,
    /// Frames arrive already H.264 encoded and must not be re-encoded
    pub h264_encoded: bool,
}

/// Sink for captured frame bytes
pub trait FrameSink: Send + Sync {
    fn write_frame(&self, frame: &[u8]);
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("capture backend failure: {0}")]
    Backend(String),
}

/// A fault raised by a running capture, relayed to the operator
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    /// The source the fault belongs to
    pub source: String,
    pub message: String,
}

/// Control over a capture that has been started
pub trait CaptureHandle: Send {
    fn is_streaming(&self) -> bool;
    fn stop(&self);
}

/// A capture in flight plus its fault channel
pub struct StartedCapture {
    pub handle: Box<dyn CaptureHandle>,
    pub events: mpsc::Receiver<CaptureEvent>,
}

/// Backend that turns a source descriptor into a running capture
pub trait CaptureService: Send + Sync {
    fn start(
        &self,
        descriptor: &SourceDescriptor,
        sink: Arc<dyn FrameSink>,
    ) -> Result<StartedCapture, CaptureError>;
}

/// Backend that produces no frames. Used when the host has no grabber
/// wired in; the relay link and control protocol still work in full.
pub struct NullCapture;

struct NullHandle {
    stopped: std::sync::atomic::AtomicBool,
}

impl CaptureHandle for NullHandle {
    fn is_streaming(&self) -> bool {
        !self.stopped.load(std::sync::atomic::Ordering::Acquire)
    }

    fn stop(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

impl CaptureService for NullCapture {
    fn start(
        &self,
        _descriptor: &SourceDescriptor,
        _sink: Arc<dyn FrameSink>,
    ) -> Result<StartedCapture, CaptureError> {
        let (_tx, events) = mpsc::channel(1);
        Ok(StartedCapture {
            handle: Box::new(NullHandle {
                stopped: std::sync::atomic::AtomicBool::new(false),
            }),
            events,
        })
    }
}
