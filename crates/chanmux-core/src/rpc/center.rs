//! RPC service center: request/response correlation over one connection.
//!
//! The center hands out an [`RpcProxy`] per service path. A proxy calls the
//! remote implementation of its path and, once a local handler is installed
//! with [`RpcProxy::on_request_service`], serves the peer's requests for the
//! same path.
//!
//! # Thread Safety
//!
//! Inbound messages arrive synchronously from the connection's callback (the
//! multiplexer's event loop for channel connections). Responses complete
//! pending calls inline; requests are dispatched on spawned tokio tasks, so
//! handlers may await without stalling the event loop. Responses to
//! concurrent requests can therefore go out in any order.

use super::connection::MessageConnection;
use super::protocol::{RpcMessage, RpcRequest, RpcResponse};
use crate::config::RpcConfig;
use crate::{MuxError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Local implementation of a service path, invoked for the peer's requests.
#[async_trait::async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    /// Dispatch one method call and return its result.
    async fn dispatch(&self, method: &str, params: Value) -> Result<Value>;
}

type PendingCall = oneshot::Sender<Result<Value>>;

/// Routes RPC traffic between service proxies and one connection.
#[derive(Clone)]
pub struct RpcServiceCenter {
    inner: Arc<CenterInner>,
}

struct CenterInner {
    connection: Mutex<Option<Arc<dyn MessageConnection>>>,
    handlers: RwLock<HashMap<String, Arc<dyn RpcHandler>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl Default for RpcServiceCenter {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcServiceCenter {
    pub fn new() -> Self {
        Self::with_call_timeout(RpcConfig::CALL_TIMEOUT)
    }

    pub fn with_call_timeout(call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CenterInner {
                connection: Mutex::new(None),
                handlers: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                call_timeout,
            }),
        }
    }

    /// Attach `connection`, replacing any previous one, and start consuming
    /// its messages.
    pub fn set_connection(&self, connection: Arc<dyn MessageConnection>) {
        let weak: Weak<CenterInner> = Arc::downgrade(&self.inner);
        connection.on_message(Arc::new(move |text: String| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_incoming(&text);
            }
        }));
        *lock(&self.inner.connection) = Some(connection);
    }

    /// Detach `connection` if it is the current one. Calls waiting on it fail
    /// with `ConnectionClosed`.
    pub fn remove_connection(&self, connection: &Arc<dyn MessageConnection>) {
        let removed = {
            let mut current = lock(&self.inner.connection);
            match current.as_ref() {
                Some(existing) if same_connection(existing, connection) => {
                    *current = None;
                    true
                }
                _ => false,
            }
        };

        if removed {
            debug!("RPC connection removed");
            self.inner.fail_pending();
        }
    }

    pub fn has_connection(&self) -> bool {
        lock(&self.inner.connection).is_some()
    }

    /// Proxy for the remote service at `service_path`.
    pub fn get_rpc_service(&self, service_path: &str) -> RpcProxy {
        RpcProxy {
            service: service_path.to_string(),
            center: self.inner.clone(),
        }
    }

    /// Whether a local handler serves `service_path`.
    pub fn has_handler(&self, service_path: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service_path)
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.inner.pending).len()
    }
}

impl CenterInner {
    fn send_message(&self, message: &RpcMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        let connection = lock(&self.connection).clone();
        match connection {
            Some(connection) => connection.send(text),
            None => Err(MuxError::ConnectionClosed),
        }
    }

    fn fail_pending(&self) {
        let pending: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
        for tx in pending {
            let _ = tx.send(Err(MuxError::ConnectionClosed));
        }
    }

    fn handler(&self, service: &str) -> Option<Arc<dyn RpcHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    fn handle_incoming(self: &Arc<Self>, text: &str) {
        let message: RpcMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Unparseable RPC message: {}", e);
                let response = RpcResponse::error(None, -32700, format!("Parse error: {}", e));
                if let Err(e) = self.send_message(&RpcMessage::Response(response)) {
                    debug!("Could not report parse error: {}", e);
                }
                return;
            }
        };

        match message {
            RpcMessage::Request(request) => self.handle_request(request),
            RpcMessage::Response(response) => self.handle_response(response),
        }
    }

    fn handle_request(self: &Arc<Self>, request: RpcRequest) {
        let RpcRequest {
            jsonrpc,
            service,
            method,
            params,
            id,
        } = request;

        if jsonrpc != RpcConfig::JSONRPC_VERSION {
            self.respond(RpcResponse::error(
                id,
                -32600,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            ));
            return;
        }

        let Some(handler) = self.handler(&service) else {
            warn!("No handler for service {} (method {})", service, method);
            if id.is_some() {
                let err = MuxError::MethodNotFound { service, method };
                self.respond(RpcResponse::from_error(id, &err));
            }
            return;
        };

        let params = params.unwrap_or(Value::Object(Default::default()));
        let center = self.clone();
        tokio::spawn(async move {
            let result = handler.dispatch(&method, params).await;
            match (id, result) {
                (Some(id), Ok(value)) => center.respond(RpcResponse::success(Some(id), value)),
                (Some(id), Err(e)) => center.respond(RpcResponse::from_error(Some(id), &e)),
                (None, Err(e)) => {
                    error!("Notification {}.{} failed: {}", service, method, e);
                }
                (None, Ok(_)) => {}
            }
        });
    }

    fn handle_response(&self, response: RpcResponse) {
        let Some(id) = response.id else {
            warn!("Dropping RPC response without id: {:?}", response.error);
            return;
        };

        match lock(&self.pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(response.into_result());
            }
            None => debug!("No pending call for response {}", id),
        }
    }

    fn respond(&self, response: RpcResponse) {
        if let Err(e) = self.send_message(&RpcMessage::Response(response)) {
            warn!("Failed to send RPC response: {}", e);
        }
    }
}

/// Client handle for one remote service path.
#[derive(Clone)]
pub struct RpcProxy {
    service: String,
    center: Arc<CenterInner>,
}

impl RpcProxy {
    pub fn service_path(&self) -> &str {
        &self.service
    }

    /// Call `method` on the remote service and wait for its result.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.center.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.center.pending).insert(id, tx);

        let request = RpcRequest::new(&self.service, method, params, id);
        if let Err(e) = self.center.send_message(&RpcMessage::Request(request)) {
            lock(&self.center.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.center.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MuxError::ConnectionClosed),
            Err(_) => {
                lock(&self.center.pending).remove(&id);
                Err(MuxError::Timeout(self.center.call_timeout))
            }
        }
    }

    /// Send `method` without waiting for (or receiving) a response.
    pub fn notify(&self, method: &str, params: Value) -> Result<()> {
        let request = RpcRequest::notification(&self.service, method, params);
        self.center.send_message(&RpcMessage::Request(request))
    }

    /// Install the local implementation the peer calls for this service path.
    pub fn on_request_service(&self, handler: Arc<dyn RpcHandler>) {
        let previous = self
            .center
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(self.service.clone(), handler);
        if previous.is_some() {
            debug!("Replaced handler for service {}", self.service);
        }
    }
}

impl fmt::Debug for RpcProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcProxy")
            .field("service", &self.service)
            .finish()
    }
}

impl fmt::Debug for RpcServiceCenter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut services: Vec<String> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        services.sort();
        f.debug_struct("RpcServiceCenter")
            .field("connected", &self.has_connection())
            .field("services", &services)
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

fn same_connection(a: &Arc<dyn MessageConnection>, b: &Arc<dyn MessageConnection>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::connection::MemoryConnection;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait::async_trait]
    impl RpcHandler for EchoHandler {
        async fn dispatch(&self, method: &str, params: Value) -> Result<Value> {
            match method {
                "echo" => Ok(params),
                "add" => {
                    let a = params["a"].as_i64().unwrap_or(0);
                    let b = params["b"].as_i64().unwrap_or(0);
                    Ok(json!(a + b))
                }
                "fail" => Err(MuxError::Other("test failure".to_string())),
                _ => Err(MuxError::MethodNotFound {
                    service: "echo".to_string(),
                    method: method.to_string(),
                }),
            }
        }
    }

    /// Two centers joined by an in-memory connection; `server` serves "echo".
    fn connected_centers() -> (RpcServiceCenter, RpcServiceCenter, Arc<MemoryConnection>) {
        let (client_conn, server_conn) = MemoryConnection::pair();
        let client = RpcServiceCenter::new();
        let server = RpcServiceCenter::new();
        client.set_connection(client_conn.clone());
        server.set_connection(server_conn);
        server
            .get_rpc_service("echo")
            .on_request_service(Arc::new(EchoHandler));
        (client, server, client_conn)
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let (client, _server, _conn) = connected_centers();
        let echo = client.get_rpc_service("echo");

        let result = echo.call("echo", json!({"hello": "world"})).await.unwrap();
        assert_eq!(result, json!({"hello": "world"}));

        let sum = echo.call("add", json!({"a": 3, "b": 4})).await.unwrap();
        assert_eq!(sum, json!(7));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_handler_error_is_returned_as_rpc_error() {
        let (client, _server, _conn) = connected_centers();

        let err = client
            .get_rpc_service("echo")
            .call("fail", json!({}))
            .await
            .unwrap_err();

        match err {
            MuxError::Rpc { code, message } => {
                assert_eq!(code, -32603);
                assert!(message.contains("test failure"));
            }
            other => panic!("Expected Rpc error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_service_returns_method_not_found() {
        let (client, _server, _conn) = connected_centers();

        let err = client
            .get_rpc_service("missing")
            .call("anything", json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, MuxError::Rpc { code: -32601, .. }));
    }

    #[tokio::test]
    async fn test_debug_reports_state() {
        let (client, server, _conn) = connected_centers();
        let rendered = format!("{:?}", server);
        assert!(rendered.contains("connected: true"));
        assert!(rendered.contains("\"echo\""));
        assert!(rendered.contains("pending_calls: 0"));

        let detached = format!("{:?}", RpcServiceCenter::new());
        assert!(detached.contains("connected: false"));
        drop(client);
    }

    #[tokio::test]
    async fn test_call_without_connection_fails() {
        let center = RpcServiceCenter::new();

        let err = center
            .get_rpc_service("echo")
            .call("echo", json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, MuxError::ConnectionClosed));
        assert_eq!(center.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_connection_fails_pending_calls() {
        let (client_conn, _server_conn) = MemoryConnection::pair();
        let client = RpcServiceCenter::new();
        // Nobody answers on the other end
        client.set_connection(client_conn.clone());

        let proxy = client.get_rpc_service("echo");
        let call = tokio::spawn(async move { proxy.call("echo", json!({})).await });

        while client.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }
        let conn: Arc<dyn MessageConnection> = client_conn;
        client.remove_connection(&conn);

        assert!(matches!(call.await.unwrap(), Err(MuxError::ConnectionClosed)));
        assert!(!client.has_connection());
    }

    #[tokio::test]
    async fn test_stray_request_does_not_settle_pending_call() {
        let (client_conn, server_conn) = MemoryConnection::pair();
        let client = RpcServiceCenter::new();
        client.set_connection(client_conn);

        let proxy = client.get_rpc_service("echo");
        let mut call = tokio::spawn(async move { proxy.call("echo", json!({})).await });
        while client.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        // A request missing its service must not be taken for the reply to id 1
        server_conn
            .send(r#"{"jsonrpc":"2.0","method":"say","id":1}"#.to_string())
            .unwrap();
        assert_eq!(client.pending_calls(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut call)
                .await
                .is_err()
        );

        server_conn
            .send(r#"{"jsonrpc":"2.0","result":"real","id":1}"#.to_string())
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!("real"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let (client_conn, _server_conn) = MemoryConnection::pair();
        let client = RpcServiceCenter::with_call_timeout(Duration::from_secs(2));
        client.set_connection(client_conn);

        let err = client
            .get_rpc_service("echo")
            .call("echo", json!({}))
            .await
            .unwrap_err();

        assert!(matches!(err, MuxError::Timeout(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_remove_other_connection_is_ignored() {
        let (client, _server, client_conn) = connected_centers();
        let (stranger, _) = MemoryConnection::pair();
        let stranger: Arc<dyn MessageConnection> = stranger;

        client.remove_connection(&stranger);
        assert!(client.has_connection());

        let conn: Arc<dyn MessageConnection> = client_conn;
        client.remove_connection(&conn);
        assert!(!client.has_connection());
    }
}
