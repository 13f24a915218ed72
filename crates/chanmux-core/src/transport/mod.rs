//! Physical transport interface.
//!
//! The multiplexer sees a transport as a text-frame duplex stream with its own
//! reconnect policy: it calls [`Transport::send`] for outbound frames and
//! consumes [`TransportEvent`]s from an unbounded receiver handed over at
//! construction. Sends made while the transport is down are buffered by the
//! transport and flushed when it reopens.
//!
//! # Implementations
//!
//! - [`MemoryTransport`]: in-process, driven by a [`MemoryPeer`]
//! - [`ReconnectingTcpTransport`]: length-prefixed frames over TCP with backoff

pub mod backoff;
pub mod frame;
pub mod memory;
pub mod tcp;

pub use backoff::BackoffConfig;
pub use memory::{MemoryPeer, MemoryTransport};
pub use tcp::ReconnectingTcpTransport;

use crate::Result;
use tokio::sync::mpsc;

/// Lifecycle and data events emitted by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is (re)established.
    Open,
    /// One inbound text frame.
    Message(String),
    /// The connection dropped or was closed.
    Close { code: u16, reason: String },
    /// Non-fatal transport error report.
    Error(String),
}

/// Receiving half of a transport's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Outbound side of a physical duplex connection.
pub trait Transport: Send + Sync + 'static {
    /// Queue a text frame for the peer.
    ///
    /// Frames sent while disconnected are buffered until the next open. An
    /// error means the transport was shut down for good.
    fn send(&self, frame: String) -> Result<()>;

    /// Whether the connection is currently established.
    fn is_open(&self) -> bool;

    /// Optional description of network quality, recorded with channel close
    /// history for reconnect diagnostics.
    fn network_hint(&self) -> Option<String> {
        None
    }
}
