//! Client-side connection bootstrap.
//!
//! Wires a transport into a multiplexer, opens the RPC channel and binds the
//! modules' back services on it.

use crate::binder::{bind_connection_service, Module};
use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::multiplexer::{ChannelMultiplexer, MultiplexerOptions};
use crate::registry::ServiceRegistry;
use crate::rpc::{ChannelConnection, MessageConnection, RpcServiceCenter};
use crate::transport::{Transport, TransportEvents};
use crate::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Hook run each time the RPC channel is re-opened after a reconnection.
pub type ReconnectHook = Arc<dyn Fn() + Send + Sync>;

/// Options for [`create_client_connection`].
#[derive(Clone)]
pub struct ClientConnectionOptions {
    pub client_id: Option<String>,
    pub heartbeat_interval: Duration,
    pub on_reconnect: Option<ReconnectHook>,
}

impl Default for ClientConnectionOptions {
    fn default() -> Self {
        Self {
            client_id: None,
            heartbeat_interval: ChannelConfig::HEARTBEAT_INTERVAL,
            on_reconnect: None,
        }
    }
}

impl ClientConnectionOptions {
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

    pub fn with_on_reconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_reconnect = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ClientConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnectionOptions")
            .field("client_id", &self.client_id)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("on_reconnect", &self.on_reconnect.is_some())
            .finish()
    }
}

/// A bootstrapped client connection.
#[derive(Clone)]
pub struct ClientConnection {
    pub multiplexer: ChannelMultiplexer,
    /// The `RPCService` channel.
    pub channel: Channel,
    pub center: RpcServiceCenter,
}

/// Bring up a client connection over `transport`.
///
/// Waits for the transport's first open, registers the multiplexer under
/// [`ChannelConfig::MULTIPLEXER_TOKEN`], opens the RPC channel and binds the
/// modules' back services on it.
pub async fn create_client_connection(
    registry: Arc<ServiceRegistry>,
    modules: &[Arc<dyn Module>],
    transport: Arc<dyn Transport>,
    events: TransportEvents,
    options: ClientConnectionOptions,
) -> Result<ClientConnection> {
    let mut mux_options =
        MultiplexerOptions::new().with_heartbeat_interval(options.heartbeat_interval);
    if let Some(client_id) = options.client_id {
        mux_options = mux_options.with_client_id(client_id);
    }

    let multiplexer = ChannelMultiplexer::new(transport, events, mux_options);
    multiplexer.init_handler().await?;
    registry.add_value(ChannelConfig::MULTIPLEXER_TOKEN, multiplexer.clone());

    let channel = multiplexer
        .open_channel(ChannelConfig::RPC_CHANNEL_PATH)
        .await?;
    if let Some(hook) = options.on_reconnect {
        channel.on_reopen(move || hook());
    }

    let connection: Arc<dyn MessageConnection> = Arc::new(ChannelConnection::new(channel.clone()));
    let center = bind_connection_service(&registry, modules, connection)?;

    info!(
        "Client connection ready (client {}, channel {})",
        multiplexer.client_id(),
        channel.id()
    );
    Ok(ClientConnection {
        multiplexer,
        channel,
        center,
    })
}
