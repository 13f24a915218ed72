//! Chanmux Core - channel multiplexing and RPC service binding over one
//! reconnecting transport.
//!
//! A [`ChannelMultiplexer`] splits a single transport into independently
//! lifecycled [`Channel`]s keyed by `{clientId}:{path}`, keeps the link alive
//! with an idle heartbeat and re-opens every channel when the transport comes
//! back. On top of that, [`bind_connection_service`] registers RPC proxies
//! for each module's back services and wires the local handlers in a second
//! pass, so services that depend on each other can both be bound.
//!
//! # Example
//!
//! ```rust,ignore
//! use chanmux_core::{
//!     create_client_connection, BackoffConfig, ClientConnectionOptions,
//!     ReconnectingTcpTransport, ServiceRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> chanmux_core::Result<()> {
//!     let (transport, events) =
//!         ReconnectingTcpTransport::connect("127.0.0.1:7420".parse().unwrap(), BackoffConfig::new());
//!     let registry = Arc::new(ServiceRegistry::new());
//!
//!     let conn = create_client_connection(
//!         registry,
//!         &[],
//!         transport,
//!         events,
//!         ClientConnectionOptions::new().with_on_reconnect(|| println!("reconnected")),
//!     )
//!     .await?;
//!
//!     let echo = conn.center.get_rpc_service("echo");
//!     let reply = echo.call("say", serde_json::json!({"text": "hi"})).await?;
//!     println!("{}", reply);
//!     Ok(())
//! }
//! ```

pub mod binder;
pub mod bootstrap;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod multiplexer;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use binder::{bind_connection_service, BackService, Module};
pub use bootstrap::{create_client_connection, ClientConnection, ClientConnectionOptions};
pub use channel::{Channel, ChannelState};
pub use codec::Envelope;
pub use config::{ChannelConfig, RpcConfig, TransportConfig};
pub use error::{MuxError, Result};
pub use heartbeat::Heartbeat;
pub use multiplexer::{ChannelMultiplexer, CloseInfo, ConnectionEvent, MultiplexerOptions};
pub use registry::{Provider, Resolver, ServiceRegistry, Token};
pub use rpc::{
    ChannelConnection, MemoryConnection, MessageConnection, RpcHandler, RpcProxy, RpcServiceCenter,
};
pub use server::{ChannelAcceptor, ChannelServer, ChannelServerHandle};
pub use transport::{
    BackoffConfig, MemoryPeer, MemoryTransport, ReconnectingTcpTransport, Transport,
    TransportEvent, TransportEvents,
};
