//! Two-phase binding of module back services onto an RPC connection.
//!
//! Phase 1 registers a proxy for every declared service path. Phase 2 then
//! resolves the local handlers (`client_token`) and wires each as the target
//! of the peer's requests on its path. Handlers may depend on any proxy from
//! Phase 1, including the proxy of a service whose handler depends back on
//! them.

use crate::registry::{ServiceRegistry, Token};
use crate::rpc::{MessageConnection, RpcServiceCenter};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One remote service a module talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackService {
    /// Path of the service on the peer, also the proxy's registry token.
    pub service_path: String,
    /// Extra token the proxy is registered under.
    pub token: Option<Token>,
    /// Token of the local handler serving the peer's requests on this path.
    pub client_token: Option<Token>,
}

impl BackService {
    pub fn new(service_path: impl Into<String>) -> Self {
        Self {
            service_path: service_path.into(),
            token: None,
            client_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<Token>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_client_token(mut self, token: impl Into<Token>) -> Self {
        self.client_token = Some(token.into());
        self
    }
}

/// A feature module contributing back services.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Services this module needs. `None` contributes nothing.
    fn back_services(&self) -> Option<Vec<BackService>> {
        None
    }
}

/// Bind every module's back services onto `connection`.
///
/// Returns the service center driving the connection. If a Phase 2 handler
/// cannot be resolved the error is returned; proxies registered in Phase 1
/// stay in the registry.
pub fn bind_connection_service(
    registry: &ServiceRegistry,
    modules: &[Arc<dyn Module>],
    connection: Arc<dyn MessageConnection>,
) -> Result<RpcServiceCenter> {
    let center = RpcServiceCenter::new();
    center.set_connection(connection.clone());

    let detach_center = center.clone();
    let detach_conn = Arc::downgrade(&connection);
    connection.on_close(Arc::new(move |code: u16, reason: &str| {
        debug!("RPC connection closed ({}: {}), detaching", code, reason);
        if let Some(conn) = detach_conn.upgrade() {
            detach_center.remove_connection(&conn);
        }
    }));

    // Strong: the center drops its reference on close, this hook is what
    // keeps the connection reachable until the channel comes back.
    let attach_center = center.clone();
    let attach_conn = connection.clone();
    connection.on_reopen(Arc::new(move || {
        debug!("RPC connection reopened, re-attaching");
        attach_center.set_connection(attach_conn.clone());
    }));

    let services: Vec<BackService> = modules
        .iter()
        .filter_map(|module| {
            let services = module.back_services();
            if services.is_none() {
                debug!("Module {} declares no back services", module.name());
            }
            services
        })
        .flatten()
        .collect();

    // Phase 1: proxies only, so handlers built in phase 2 can depend on any of them
    let mut deferred = Vec::new();
    for service in &services {
        let proxy = center.get_rpc_service(&service.service_path);
        registry.add_value(service.service_path.as_str(), proxy.clone());
        if let Some(token) = &service.token {
            registry.add_value(token.clone(), proxy);
        }
        if service.client_token.is_some() {
            deferred.push(service);
        }
    }

    // Phase 2
    for service in deferred {
        let Some(client_token) = &service.client_token else {
            continue;
        };
        let handler = registry.get_handler(client_token).map_err(|e| {
            warn!(
                "Failed to resolve handler {} for {}: {}",
                client_token, service.service_path, e
            );
            e
        })?;
        center
            .get_rpc_service(&service.service_path)
            .on_request_service(handler);
    }

    info!(
        "Bound {} back services ({} served locally)",
        services.len(),
        services.iter().filter(|s| s.client_token.is_some()).count()
    );
    Ok(center)
}
