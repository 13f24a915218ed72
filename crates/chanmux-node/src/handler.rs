//! RPC handlers served by the node.

use async_trait::async_trait;
use chanmux_core::{MuxError, Result, RpcHandler};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Registry token of the echo handler.
pub const ECHO_HANDLER: &str = "EchoHandler";
/// Registry token of the system handler.
pub const SYSTEM_HANDLER: &str = "SystemHandler";

/// `echo` service: returns what it is given.
pub struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
        debug!("echo.{}", method);
        match method {
            "say" => {
                let text = params
                    .get("text")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| MuxError::InvalidParams {
                        message: "Missing required parameter: text".to_string(),
                    })?;
                Ok(json!({"echo": text}))
            }
            "echo" => Ok(params),
            _ => Err(MuxError::MethodNotFound {
                service: "echo".to_string(),
                method: method.to_string(),
            }),
        }
    }
}

/// Node-wide counters shared by every connection.
pub struct NodeStats {
    started: Instant,
    channels: AtomicU64,
}

impl NodeStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            started: Instant::now(),
            channels: AtomicU64::new(0),
        })
    }

    pub fn channel_opened(&self) {
        self.channels.fetch_add(1, Ordering::Relaxed);
    }
}

/// `system` service: liveness and node status.
pub struct SystemHandler {
    stats: Arc<NodeStats>,
}

impl SystemHandler {
    pub fn new(stats: Arc<NodeStats>) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl RpcHandler for SystemHandler {
    async fn dispatch(&self, method: &str, _params: Value) -> Result<Value> {
        match method {
            "ping" => Ok(json!("pong")),
            "status" => Ok(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_secs": self.stats.started.elapsed().as_secs(),
                "channels_opened": self.stats.channels.load(Ordering::Relaxed),
            })),
            _ => Err(MuxError::MethodNotFound {
                service: "system".to_string(),
                method: method.to_string(),
            }),
        }
    }
}
