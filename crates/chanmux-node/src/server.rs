//! Channel server wiring for the node.

use crate::handler::{EchoHandler, NodeStats, SystemHandler, ECHO_HANDLER, SYSTEM_HANDLER};
use chanmux_core::{
    bind_connection_service, BackService, Channel, ChannelConfig, ChannelConnection,
    ChannelServer, ChannelServerHandle, MessageConnection, Module, ServiceRegistry,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Services the node serves to every client.
struct NodeModule;

impl Module for NodeModule {
    fn name(&self) -> &str {
        "node"
    }

    fn back_services(&self) -> Option<Vec<BackService>> {
        Some(vec![
            BackService::new("echo").with_client_token(ECHO_HANDLER),
            BackService::new("system").with_client_token(SYSTEM_HANDLER),
        ])
    }
}

/// Start the channel server.
///
/// Every `RPCService` channel gets its own registry and service center with
/// the node's handlers bound on it. Other paths are left unserved.
pub async fn start_server(host: &str, port: u16) -> anyhow::Result<ChannelServerHandle> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let stats = NodeStats::new();
    let modules: Vec<Arc<dyn Module>> = vec![Arc::new(NodeModule)];

    let acceptor = move |channel: Channel| {
        if channel.path() != ChannelConfig::RPC_CHANNEL_PATH {
            warn!("No service behind channel path {}", channel.path());
            return;
        }

        stats.channel_opened();
        let registry = ServiceRegistry::new();
        registry.add_handler(ECHO_HANDLER, Arc::new(EchoHandler));
        registry.add_handler(SYSTEM_HANDLER, Arc::new(SystemHandler::new(stats.clone())));

        let id = channel.id().to_string();
        let connection: Arc<dyn MessageConnection> = Arc::new(ChannelConnection::new(channel));
        match bind_connection_service(&registry, &modules, connection) {
            Ok(_) => debug!("Services bound on {}", id),
            Err(e) => error!("Failed to bind services on {}: {}", id, e),
        }
    };

    Ok(ChannelServer::start(addr, Arc::new(acceptor)).await?)
}
