//! Channel multiplexer over a single transport.
//!
//! The multiplexer owns the transport handle and the map of channels keyed by
//! `{clientId}:{path}`. One event-loop task consumes the transport's event
//! stream in order and is the only place inbound traffic is dispatched:
//!
//! - `Open`: announce the client id, arm the heartbeat and, on a
//!   reconnection, re-open every channel and fire its re-open hooks
//! - `Message`: re-arm the heartbeat, decode, route by channel id
//! - `Close`: disarm the heartbeat and close every live channel (channels
//!   stay in the map and are re-opened on the next `Open`)
//! - `Error`: log and publish
//!
//! Every channel records its last close in the close history, whoever closed
//! it. Connection lifecycle changes are also published as [`ConnectionEvent`]s
//! on a broadcast channel (see [`ChannelMultiplexer::subscribe`]).

use crate::channel::{Channel, ChannelState, SendFn};
use crate::codec::{decode, encode, Envelope};
use crate::config::ChannelConfig;
use crate::heartbeat::Heartbeat;
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::{MuxError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options for a [`ChannelMultiplexer`].
#[derive(Debug, Clone)]
pub struct MultiplexerOptions {
    /// Identity announced to the peer. Generated (`CLIENT_ID_<uuid>`) when `None`.
    pub client_id: Option<String>,
    /// Idle period before a heartbeat is sent.
    pub heartbeat_interval: Duration,
}

impl Default for MultiplexerOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            heartbeat_interval: ChannelConfig::HEARTBEAT_INTERVAL,
        }
    }
}

impl MultiplexerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Last known close of a channel, kept for reconnect diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub channel_path: String,
    pub code: u16,
    pub reason: String,
    /// Network quality reported by the transport at close time.
    pub network_hint: Option<String>,
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open,
    Close { code: u16, reason: String },
    Error(String),
    /// A channel reached `Open` again after a reconnection.
    ChannelReconnected {
        id: String,
        close_info: Option<CloseInfo>,
    },
}

/// Splits one transport into independently lifecycled channels.
#[derive(Clone)]
pub struct ChannelMultiplexer {
    inner: Arc<MuxInner>,
}

struct MuxInner {
    client_id: String,
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<String, Channel>>,
    close_history: Mutex<HashMap<String, CloseInfo>>,
    /// Channels with a reconnect notification still waiting for `ready`.
    reconnect_waiters: Mutex<HashSet<String>>,
    heartbeat: Heartbeat,
    /// Taken by `init_handler`.
    events: Mutex<Option<TransportEvents>>,
    notify_tx: broadcast::Sender<ConnectionEvent>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelMultiplexer {
    /// Create a multiplexer over `transport` and its event stream.
    ///
    /// Nothing is processed until [`ChannelMultiplexer::init_handler`] runs.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        options: MultiplexerOptions,
    ) -> Self {
        let client_id = options
            .client_id
            .unwrap_or_else(|| format!("{}{}", ChannelConfig::CLIENT_ID_PREFIX, Uuid::new_v4()));

        let beat_transport = transport.clone();
        let beat_client_id = client_id.clone();
        let heartbeat = Heartbeat::new(
            options.heartbeat_interval,
            Arc::new(move || {
                send_envelope(
                    beat_transport.as_ref(),
                    &Envelope::Heartbeat {
                        client_id: beat_client_id.clone(),
                    },
                );
            }),
        );

        let (notify_tx, _) = broadcast::channel(ChannelConfig::EVENT_BUFFER);

        Self {
            inner: Arc::new(MuxInner {
                client_id,
                transport,
                channels: Mutex::new(HashMap::new()),
                close_history: Mutex::new(HashMap::new()),
                reconnect_waiters: Mutex::new(HashSet::new()),
                heartbeat,
                events: Mutex::new(Some(events)),
                notify_tx,
                loop_handle: Mutex::new(None),
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Start processing transport events.
    ///
    /// Resolves once the first `Open` has been handled. Fails if the event
    /// stream ends before that, or if called twice.
    pub async fn init_handler(&self) -> Result<()> {
        let events = lock(&self.inner.events)
            .take()
            .ok_or(MuxError::AlreadyInitialized)?;

        let (opened_tx, opened_rx) = oneshot::channel();
        let handle = tokio::spawn(run_event_loop(
            Arc::downgrade(&self.inner),
            events,
            opened_tx,
        ));
        *lock(&self.inner.loop_handle) = Some(handle);

        opened_rx.await.map_err(|_| MuxError::TransportClosed {
            reason: "transport event stream ended before the first open".to_string(),
        })
    }

    /// Open a channel for `path` and wait until the peer acknowledges it.
    ///
    /// The channel id is `{clientId}:{path}`. An existing entry under the same
    /// id is replaced.
    pub async fn open_channel(&self, path: &str) -> Result<Channel> {
        let id = format!("{}:{}", self.inner.client_id, path);
        let channel = Channel::new(id.clone(), path, self.inner.channel_send());

        if let Some(previous) = self.inner.channels().insert(id.clone(), channel.clone()) {
            warn!("Replacing channel {} (was {})", id, previous.state());
            lock(&self.inner.reconnect_waiters).remove(&id);
        }

        let history = Arc::downgrade(&self.inner);
        let history_id = id.clone();
        let history_path = path.to_string();
        channel.on_close(move |code, reason| {
            if let Some(inner) = history.upgrade() {
                inner.record_close(&history_id, &history_path, code, reason);
            }
        });

        let (opened_tx, opened_rx) = oneshot::channel();
        channel.once_open(move || {
            let _ = opened_tx.send(());
        });
        channel.open(path);

        opened_rx.await.map_err(|_| MuxError::ChannelClosed { id })?;
        debug!("Channel {} open", channel.id());
        Ok(channel)
    }

    /// Look up a channel by id.
    pub fn channel(&self, id: &str) -> Option<Channel> {
        self.inner.channels().get(id).cloned()
    }

    /// Ids of every registered channel.
    pub fn channel_ids(&self) -> Vec<String> {
        self.inner.channels().keys().cloned().collect()
    }

    /// Last recorded close of channel `id`.
    pub fn close_info(&self, id: &str) -> Option<CloseInfo> {
        self.inner.close_history().get(id).cloned()
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.notify_tx.subscribe()
    }

    pub fn is_heartbeat_armed(&self) -> bool {
        self.inner.heartbeat.is_armed()
    }

    /// Cancel the heartbeat timer. Channels are left as they are.
    pub fn dispose(&self) {
        self.inner.heartbeat.disarm();
    }
}

impl MuxInner {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        lock(&self.channels)
    }

    fn close_history(&self) -> MutexGuard<'_, HashMap<String, CloseInfo>> {
        lock(&self.close_history)
    }

    /// Send function handed to every channel: relay to the transport and
    /// log failures.
    fn channel_send(&self) -> SendFn {
        let transport = self.transport.clone();
        Arc::new(move |frame: String| {
            if let Err(e) = transport.send(frame) {
                warn!("Channel send failed: {}", e);
            }
        })
    }

    fn publish(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.notify_tx.send(event);
    }

    fn handle_open(self: &Arc<Self>, reconnect: bool) {
        info!(
            "Transport open (client {}, reconnect: {})",
            self.client_id, reconnect
        );
        send_envelope(
            self.transport.as_ref(),
            &Envelope::Client {
                client_id: self.client_id.clone(),
            },
        );
        self.heartbeat.arm();
        self.publish(ConnectionEvent::Open);

        if !reconnect {
            return;
        }

        let channels: Vec<Channel> = self.channels().values().cloned().collect();
        for channel in channels {
            self.watch_reconnect(&channel);
            channel.open(channel.path());
            channel.fire_reopen();
        }
    }

    /// Publish `ChannelReconnected` when `channel` next reaches `Open`. At
    /// most one notification per channel is pending at a time.
    fn watch_reconnect(self: &Arc<Self>, channel: &Channel) {
        let id = channel.id().to_string();
        if !lock(&self.reconnect_waiters).insert(id.clone()) {
            debug!("Channel {} already waiting for ready after reconnect", id);
            return;
        }

        let weak = Arc::downgrade(self);
        channel.once_open(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            lock(&inner.reconnect_waiters).remove(&id);
            let close_info = inner.close_history().get(&id).cloned();
            match &close_info {
                Some(info) => info!(
                    "Channel reconnect {} (closed with {}: {}, network: {:?})",
                    id, info.code, info.reason, info.network_hint
                ),
                None => info!("Channel reconnect {}", id),
            }
            inner.publish(ConnectionEvent::ChannelReconnected { id, close_info });
        });
    }

    fn handle_message(&self, text: &str) {
        // Any inbound traffic counts as liveness
        self.heartbeat.arm();

        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                return;
            }
        };

        let Some(id) = envelope.channel_id() else {
            debug!("Ignoring {} envelope from peer", envelope.kind());
            return;
        };

        let channel = self.channels().get(id).cloned();
        match channel {
            Some(channel) => channel.handle_message(envelope),
            None => {
                warn!("Channel {} not found, dropping {} envelope", id, envelope.kind());
            }
        }
    }

    fn handle_close(&self, code: u16, reason: &str) {
        info!("Transport closed ({}: {})", code, reason);
        self.heartbeat.disarm();

        let live: Vec<Channel> = self
            .channels()
            .values()
            .filter(|channel| channel.state() != ChannelState::Closed)
            .cloned()
            .collect();
        for channel in live {
            channel.close(code, reason);
        }

        self.publish(ConnectionEvent::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn handle_error(&self, message: String) {
        error!("Transport error: {}", message);
        self.publish(ConnectionEvent::Error(message));
    }

    fn record_close(&self, id: &str, path: &str, code: u16, reason: &str) {
        let info = CloseInfo {
            channel_path: path.to_string(),
            code,
            reason: reason.to_string(),
            network_hint: self.transport.network_hint(),
        };
        self.close_history().insert(id.to_string(), info);
    }
}

impl Drop for MuxInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .loop_handle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn run_event_loop(
    inner: Weak<MuxInner>,
    mut events: TransportEvents,
    opened_tx: oneshot::Sender<()>,
) {
    let mut opened_tx = Some(opened_tx);
    let mut opens: u64 = 0;

    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            debug!("Multiplexer dropped, stopping event loop");
            return;
        };

        match event {
            TransportEvent::Open => {
                inner.handle_open(opens > 0);
                opens += 1;
                if let Some(tx) = opened_tx.take() {
                    let _ = tx.send(());
                }
            }
            TransportEvent::Message(text) => inner.handle_message(&text),
            TransportEvent::Close { code, reason } => inner.handle_close(code, &reason),
            TransportEvent::Error(message) => inner.handle_error(message),
        }
    }

    debug!("Transport event stream ended");
}

fn send_envelope(transport: &dyn Transport, envelope: &Envelope) {
    let result = encode(envelope).and_then(|text| transport.send(text));
    if let Err(e) = result {
        warn!("Failed to send {} envelope: {}", envelope.kind(), e);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;

    #[tokio::test]
    async fn test_generated_client_id_has_prefix() {
        let (transport, _peer, events) = MemoryTransport::pair();
        let mux = ChannelMultiplexer::new(transport, events, MultiplexerOptions::default());

        assert!(mux.client_id().starts_with(ChannelConfig::CLIENT_ID_PREFIX));
    }

    #[tokio::test]
    async fn test_init_handler_twice_fails() {
        let (transport, peer, events) = MemoryTransport::pair();
        let mux = ChannelMultiplexer::new(
            transport,
            events,
            MultiplexerOptions::new().with_client_id("C1"),
        );

        peer.open();
        mux.init_handler().await.unwrap();

        assert!(matches!(
            mux.init_handler().await,
            Err(MuxError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_init_handler_fails_when_events_end_before_open() {
        // Event stream whose sender is already gone
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(tx);
        let (transport, _peer, _unused) = MemoryTransport::pair();
        let mux = ChannelMultiplexer::new(transport, rx, MultiplexerOptions::default());

        assert!(matches!(
            mux.init_handler().await,
            Err(MuxError::TransportClosed { .. })
        ));
    }
}
