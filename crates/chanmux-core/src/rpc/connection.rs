//! Message-oriented connections consumed by the RPC service center.

use crate::channel::{Channel, CloseCallback, LifecycleCallback, MessageCallback};
use crate::config::TransportConfig;
use crate::{MuxError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// A duplex stream of whole text messages with a close notification.
pub trait MessageConnection: Send + Sync + 'static {
    /// Send one message to the peer.
    fn send(&self, message: String) -> Result<()>;

    /// Register the callback for inbound messages, replacing any previous one.
    fn on_message(&self, callback: MessageCallback);

    /// Register a callback fired when the connection closes.
    fn on_close(&self, callback: CloseCallback);

    /// Register a callback fired when a closed connection comes back.
    ///
    /// Connections that cannot come back ignore it.
    fn on_reopen(&self, _callback: LifecycleCallback) {}
}

/// [`MessageConnection`] view of a [`Channel`].
///
/// Closes and re-opens follow the channel, so an RPC connection over a
/// multiplexed channel survives transport reconnection.
#[derive(Clone, Debug)]
pub struct ChannelConnection {
    channel: Channel,
}

impl ChannelConnection {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }
}

impl MessageConnection for ChannelConnection {
    fn send(&self, message: String) -> Result<()> {
        self.channel.send(message);
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) {
        self.channel.on_message(move |content| callback(content));
    }

    fn on_close(&self, callback: CloseCallback) {
        self.channel.on_close(move |code, reason| callback(code, reason));
    }

    fn on_reopen(&self, callback: LifecycleCallback) {
        self.channel.on_reopen(move || callback());
    }
}

#[derive(Default)]
struct Endpoint {
    message: Mutex<Option<MessageCallback>>,
    close: Mutex<Vec<CloseCallback>>,
}

/// In-process connection pair. What one end sends, the other end's message
/// callback receives synchronously.
pub struct MemoryConnection {
    local: Arc<Endpoint>,
    remote: Arc<Endpoint>,
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    pub fn pair() -> (Arc<MemoryConnection>, Arc<MemoryConnection>) {
        let a = Arc::new(Endpoint::default());
        let b = Arc::new(Endpoint::default());
        let closed = Arc::new(AtomicBool::new(false));

        (
            Arc::new(MemoryConnection {
                local: a.clone(),
                remote: b.clone(),
                closed: closed.clone(),
            }),
            Arc::new(MemoryConnection {
                local: b,
                remote: a,
                closed,
            }),
        )
    }

    /// Close both ends, firing each end's close callbacks.
    pub fn close(&self, code: u16, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for endpoint in [&self.local, &self.remote] {
            let callbacks = endpoint
                .close
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in callbacks {
                callback(code, reason);
            }
        }
    }

    /// Close with the normal close code.
    pub fn shutdown(&self) {
        self.close(TransportConfig::NORMAL_CLOSE_CODE, "closed");
    }
}

impl MessageConnection for MemoryConnection {
    fn send(&self, message: String) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MuxError::ConnectionClosed);
        }

        let callback = self
            .remote
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match callback {
            Some(callback) => callback(message),
            None => warn!("Memory connection peer has no message handler, dropping message"),
        }
        Ok(())
    }

    fn on_message(&self, callback: MessageCallback) {
        *self
            .local
            .message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn on_close(&self, callback: CloseCallback) {
        self.local
            .close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }
}
