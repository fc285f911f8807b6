//! Ordered handshake layer pipeline
//!
//! The earliest bytes of a relay connection belong to whichever handshake
//! layer is still negotiating: the proxy tunnel first, then the
//! bounce-server handshake, then the ready signal. Each layer consumes or
//! transforms inbound events and decides what (if anything) the next layer
//! sees. Layers execute strictly in order on the connection driver task,
//! so no layer state is ever mutated concurrently.

use super::NetError;
use bytes::Bytes;
use std::collections::VecDeque;

/// An inbound event delivered to a handshake layer
#[derive(Debug, Clone)]
pub enum LayerEvent {
    /// The underlying transport (or the previous layer) became active
    Active,
    /// Bytes read from the transport (or forwarded by the previous layer)
    Read(Bytes),
    /// The underlying transport became inactive
    Inactive,
}

/// Collects a layer's reactions to one event
#[derive(Debug, Default)]
pub struct LayerOutput {
    /// Bytes to write to the transport
    pub writes: Vec<Bytes>,
    /// Events to deliver to the next layer, in order
    pub forwards: Vec<LayerEvent>,
    /// Terminal failure; aborts the dispatch and fails the pending result
    pub failure: Option<NetError>,
}

impl LayerOutput {
    pub fn write(&mut self, data: Bytes) {
        self.writes.push(data);
    }

    pub fn forward(&mut self, event: LayerEvent) {
        self.forwards.push(event);
    }

    pub fn fail(&mut self, err: impl Into<NetError>) {
        self.failure = Some(err.into());
    }
}

/// An ordered interceptor over the inbound byte-event stream.
///
/// A layer owns the earliest bytes of the connection until its negotiation
/// completes; afterwards it forwards events unchanged.
pub trait HandshakeLayer: Send {
    fn on_event(&mut self, event: LayerEvent, out: &mut LayerOutput);
}

/// Result of dispatching one event through the whole stack
#[derive(Debug, Default)]
pub struct StackOutput {
    /// Bytes to write to the transport, in order
    pub writes: Vec<Bytes>,
    /// Failure raised by some layer; the connection must be closed
    pub failure: Option<NetError>,
}

/// Drives events through an ordered list of handshake layers.
///
/// Events forwarded past the last layer are dropped.
pub struct LayerStack {
    layers: Vec<Box<dyn HandshakeLayer>>,
}

impl LayerStack {
    pub fn new(layers: Vec<Box<dyn HandshakeLayer>>) -> Self {
        Self { layers }
    }

    /// Deliver `event` to the first layer and propagate forwards in order.
    pub fn dispatch(&mut self, event: LayerEvent) -> StackOutput {
        let mut output = StackOutput::default();
        let mut queue: VecDeque<(usize, LayerEvent)> = VecDeque::new();
        queue.push_back((0, event));

        while let Some((index, event)) = queue.pop_front() {
            let Some(layer) = self.layers.get_mut(index) else {
                continue;
            };

            let mut out = LayerOutput::default();
            layer.on_event(event, &mut out);

            output.writes.append(&mut out.writes);
            if let Some(err) = out.failure {
                output.failure = Some(err);
                break;
            }
            // FIFO keeps per-layer arrival order intact across the stack.
            for forwarded in out.forwards {
                queue.push_back((index + 1, forwarded));
            }
        }

        output
    }
}
