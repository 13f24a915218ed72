//! Logical channels multiplexed over one transport.
//!
//! A [`Channel`] is a cheap clonable handle. It owns its lifecycle state and
//! its hook lists but not the transport: outbound frames go through the send
//! function bound at construction, and inbound envelopes are pushed in by the
//! multiplexer (client side) or the channel server (peer side).
//!
//! # State machine
//!
//! ```text
//! Closed --open()--> Opening --ready--> Open --close()--> Closed
//!    ^                  |                                   |
//!    +------------------+------------ open() ---------------+
//! ```
//!
//! Hooks are invoked synchronously, in registration order, on whichever task
//! delivered the triggering event. No lock is held while a hook runs, so a
//! hook may register further hooks or send on the channel.

use crate::codec::{encode, Envelope};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

/// Outbound send operation bound to the owning transport.
pub type SendFn = Arc<dyn Fn(String) + Send + Sync>;

/// Receives the `content` of inbound `data` envelopes.
pub type MessageCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Receives the close code and reason.
pub type CloseCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;

/// Repeating open/re-open hook.
pub type LifecycleCallback = Arc<dyn Fn() + Send + Sync>;

type OpenWaiter = Box<dyn FnOnce() + Send>;

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Closed => write!(f, "CLOSED"),
            ChannelState::Opening => write!(f, "OPENING"),
            ChannelState::Open => write!(f, "OPEN"),
        }
    }
}

/// Handle to a logical channel. Clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    id: String,
    path: String,
    send_fn: SendFn,
    lifecycle: Mutex<Lifecycle>,
    hooks: Mutex<Hooks>,
}

struct Lifecycle {
    state: ChannelState,
    /// Completed `Opening -> Open` transitions.
    open_count: u64,
}

#[derive(Default)]
struct Hooks {
    message: Option<MessageCallback>,
    open: Vec<LifecycleCallback>,
    close: Vec<CloseCallback>,
    reopen: Vec<LifecycleCallback>,
    pending_open_waiters: Vec<OpenWaiter>,
}

impl Channel {
    /// Create a closed channel bound to `send_fn`.
    pub fn new(id: impl Into<String>, path: impl Into<String>, send_fn: SendFn) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: id.into(),
                path: path.into(),
                send_fn,
                lifecycle: Mutex::new(Lifecycle {
                    state: ChannelState::Closed,
                    open_count: 0,
                }),
                hooks: Mutex::new(Hooks::default()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub fn state(&self) -> ChannelState {
        self.lifecycle().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Number of times this channel has reached `Open`.
    pub fn open_count(&self) -> u64 {
        self.lifecycle().open_count
    }

    /// Whether a message callback is registered.
    pub fn has_message_handler(&self) -> bool {
        self.hooks().message.is_some()
    }

    /// Move to `Opening` and ask the peer to open `path`.
    ///
    /// Waiters registered with [`Channel::once_open`] fire when the peer's
    /// `ready` arrives.
    pub fn open(&self, path: &str) {
        self.lifecycle().state = ChannelState::Opening;
        debug!("Opening channel {}", self.inner.id);
        self.send_envelope(&Envelope::Open {
            id: self.inner.id.clone(),
            path: path.to_string(),
        });
    }

    /// Send an opaque payload to the peer.
    pub fn send(&self, content: impl Into<String>) {
        self.send_envelope(&Envelope::Data {
            id: self.inner.id.clone(),
            content: content.into(),
        });
    }

    /// Dispatch an inbound envelope addressed to this channel.
    pub fn handle_message(&self, envelope: Envelope) {
        match envelope {
            Envelope::Ready { .. } => self.fire_open(),
            Envelope::Data { content, .. } => {
                let callback = self.hooks().message.clone();
                match callback {
                    Some(callback) => callback(content),
                    None => {
                        // The peer sent data before this side registered a
                        // handler; nothing can consume it.
                        error!(
                            "Channel {} not ready: dropping data received before a message handler was registered",
                            self.inner.id
                        );
                    }
                }
            }
            Envelope::Close { code, reason, .. } => {
                self.close(code.unwrap_or(0), reason.as_deref().unwrap_or(""));
            }
            other => {
                debug!(
                    "Channel {} ignoring {} envelope",
                    self.inner.id,
                    other.kind()
                );
            }
        }
    }

    /// Register the message callback, replacing any previous one.
    pub fn on_message<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.hooks().message = Some(Arc::new(callback));
    }

    /// Register a hook fired on every `Opening -> Open` transition.
    pub fn on_open<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks().open.push(Arc::new(callback));
    }

    /// Register a one-shot waiter fired on the next `Opening -> Open` transition.
    pub fn once_open<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks().pending_open_waiters.push(Box::new(callback));
    }

    /// Register a hook fired with the code and reason whenever the channel closes.
    pub fn on_close<F>(&self, callback: F)
    where
        F: Fn(u16, &str) + Send + Sync + 'static,
    {
        self.hooks().close.push(Arc::new(callback));
    }

    /// Register a hook fired each time the channel is re-opened after a
    /// reconnection. Never fired for the first open.
    pub fn on_reopen<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.hooks().reopen.push(Arc::new(callback));
    }

    /// Fire the re-open hooks.
    pub fn fire_reopen(&self) {
        let hooks = self.hooks().reopen.clone();
        for hook in hooks {
            hook();
        }
    }

    /// Move to `Closed` and fire the close hooks. The peer is not notified.
    pub fn close(&self, code: u16, reason: &str) {
        self.lifecycle().state = ChannelState::Closed;
        debug!("Channel {} closed ({}: {})", self.inner.id, code, reason);

        let hooks = self.hooks().close.clone();
        for hook in hooks {
            hook(code, reason);
        }
    }

    /// Notify the peer with a `close` envelope, then close locally.
    pub fn send_close(&self, code: u16, reason: &str) {
        self.send_envelope(&Envelope::Close {
            id: self.inner.id.clone(),
            code: Some(code),
            reason: Some(reason.to_string()),
        });
        self.close(code, reason);
    }

    /// Peer side: mark the channel open and acknowledge with `ready`.
    pub fn acknowledge_open(&self) {
        self.lifecycle().state = ChannelState::Opening;
        self.send_envelope(&Envelope::Ready {
            id: self.inner.id.clone(),
        });
        self.fire_open();
    }

    fn fire_open(&self) {
        {
            let mut lifecycle = self.lifecycle();
            // Only an open request in flight can be acknowledged
            if lifecycle.state != ChannelState::Opening {
                debug!(
                    "Channel {} is {}, ignoring ready",
                    self.inner.id, lifecycle.state
                );
                return;
            }
            lifecycle.state = ChannelState::Open;
            lifecycle.open_count += 1;
        }

        let (waiters, hooks) = {
            let mut hooks = self.hooks();
            (
                std::mem::take(&mut hooks.pending_open_waiters),
                hooks.open.clone(),
            )
        };
        for waiter in waiters {
            waiter();
        }
        for hook in hooks {
            hook();
        }
    }

    fn send_envelope(&self, envelope: &Envelope) {
        match encode(envelope) {
            Ok(text) => (self.inner.send_fn)(text),
            Err(e) => warn!(
                "Channel {} failed to encode {} envelope: {}",
                self.inner.id,
                envelope.kind(),
                e
            ),
        }
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn hooks(&self) -> std::sync::MutexGuard<'_, Hooks> {
        self.inner.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}
