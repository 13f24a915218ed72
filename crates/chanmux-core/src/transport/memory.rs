//! In-process transport.
//!
//! [`MemoryTransport::pair`] returns the transport handed to a multiplexer,
//! a [`MemoryPeer`] that plays the remote side, and the event receiver. The
//! peer decides when the connection opens or drops and sees every frame the
//! transport sends. Frames sent while closed are held and flushed, in order,
//! just before the next `Open` event.

use super::{Transport, TransportEvent, TransportEvents};
use crate::{MuxError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

struct Shared {
    open: AtomicBool,
    /// Frames sent while closed.
    pending: Mutex<VecDeque<String>>,
    outbound_tx: mpsc::UnboundedSender<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    network_hint: Mutex<Option<String>>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transport half of an in-memory connection.
#[derive(Clone)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

/// Remote half of an in-memory connection.
pub struct MemoryPeer {
    shared: Arc<Shared>,
    outbound_rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryTransport {
    /// Create a closed in-memory connection.
    pub fn pair() -> (Arc<MemoryTransport>, MemoryPeer, TransportEvents) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            open: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            outbound_tx,
            events_tx,
            network_hint: Mutex::new(None),
        });

        (
            Arc::new(MemoryTransport {
                shared: shared.clone(),
            }),
            MemoryPeer {
                shared,
                outbound_rx,
            },
            events_rx,
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: String) -> Result<()> {
        // Checked under the pending lock so a concurrent open cannot strand
        // the frame in the buffer.
        let mut pending = self.shared.pending();
        if self.shared.open.load(Ordering::SeqCst) {
            self.shared
                .outbound_tx
                .send(frame)
                .map_err(|_| MuxError::TransportClosed {
                    reason: "memory peer dropped".to_string(),
                })
        } else {
            pending.push_back(frame);
            Ok(())
        }
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    fn network_hint(&self) -> Option<String> {
        self.shared
            .network_hint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MemoryPeer {
    /// Establish the connection: flush buffered frames, then emit `Open`.
    pub fn open(&self) {
        {
            let mut pending = self.shared.pending();
            while let Some(frame) = pending.pop_front() {
                let _ = self.shared.outbound_tx.send(frame);
            }
            self.shared.open.store(true, Ordering::SeqCst);
        }
        self.emit(TransportEvent::Open);
    }

    /// Drop the connection with a close code and reason.
    pub fn close(&self, code: u16, reason: &str) {
        self.shared.open.store(false, Ordering::SeqCst);
        self.emit(TransportEvent::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Deliver one inbound frame to the transport's owner.
    pub fn deliver(&self, frame: impl Into<String>) {
        self.emit(TransportEvent::Message(frame.into()));
    }

    /// Report a transport error.
    pub fn error(&self, message: &str) {
        self.emit(TransportEvent::Error(message.to_string()));
    }

    /// Set the network quality hint reported by the transport.
    pub fn set_network_hint(&self, hint: Option<String>) {
        *self
            .shared
            .network_hint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hint;
    }

    /// Wait for the next frame sent by the transport.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound_rx.recv().await
    }

    /// Take the next sent frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound_rx.try_recv().ok()
    }

    /// Take every frame sent so far.
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbound_rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn emit(&self, event: TransportEvent) {
        // The owner may already be gone; nothing to report to.
        let _ = self.shared.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_sent_while_closed_flush_on_open() {
        let (transport, mut peer, mut events) = MemoryTransport::pair();

        transport.send("early".into()).unwrap();
        assert!(peer.try_recv().is_none());

        peer.open();
        assert_eq!(peer.recv().await.as_deref(), Some("early"));
        assert_eq!(events.recv().await, Some(TransportEvent::Open));

        transport.send("live".into()).unwrap();
        assert_eq!(peer.recv().await.as_deref(), Some("live"));
    }

    #[tokio::test]
    async fn test_close_stops_direct_delivery() {
        let (transport, mut peer, mut events) = MemoryTransport::pair();
        peer.open();
        peer.close(1006, "gone");

        assert!(!transport.is_open());
        transport.send("queued".into()).unwrap();
        assert!(peer.try_recv().is_none());

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Close {
                code: 1006,
                reason: "gone".into()
            })
        );
    }

    #[tokio::test]
    async fn test_network_hint_is_reported() {
        let (transport, peer, _events) = MemoryTransport::pair();
        assert_eq!(transport.network_hint(), None);

        peer.set_network_hint(Some("4g".into()));
        assert_eq!(transport.network_hint().as_deref(), Some("4g"));
    }
}
