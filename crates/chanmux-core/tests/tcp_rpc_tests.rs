//! End-to-end RPC over the reconnecting TCP transport and the channel server.

use chanmux_core::{
    bind_connection_service, create_client_connection, BackService, BackoffConfig, Channel,
    ChannelAcceptor, ChannelConnection, ChannelServer, ChannelServerHandle,
    ClientConnectionOptions, ConnectionEvent, MessageConnection, Module, MuxError,
    ReconnectingTcpTransport, RpcHandler, ServiceRegistry,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

struct EchoHandler;

#[async_trait::async_trait]
impl RpcHandler for EchoHandler {
    async fn dispatch(&self, method: &str, params: Value) -> chanmux_core::Result<Value> {
        match method {
            "say" => Ok(json!({"echo": params["text"]})),
            _ => Err(MuxError::MethodNotFound {
                service: "echo".to_string(),
                method: method.to_string(),
            }),
        }
    }
}

struct EchoModule;

impl Module for EchoModule {
    fn name(&self) -> &str {
        "echo"
    }

    fn back_services(&self) -> Option<Vec<BackService>> {
        Some(vec![BackService::new("echo").with_client_token("EchoHandler")])
    }
}

/// Serves the `echo` service on every channel a client opens.
fn echo_acceptor() -> Arc<dyn ChannelAcceptor> {
    Arc::new(|channel: Channel| {
        let registry = ServiceRegistry::new();
        registry.add_handler("EchoHandler", Arc::new(EchoHandler));
        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(EchoModule)];
        let connection: Arc<dyn MessageConnection> = Arc::new(ChannelConnection::new(channel));
        bind_connection_service(&registry, &modules, connection).unwrap();
    })
}

async fn start_server(addr: SocketAddr) -> ChannelServerHandle {
    ChannelServer::start(addr, echo_acceptor()).await.unwrap()
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig::new()
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(100))
        .with_jitter(false)
}

#[tokio::test]
async fn test_end_to_end_rpc_call() {
    let server = start_server("127.0.0.1:0".parse().unwrap()).await;
    let (transport, events) = ReconnectingTcpTransport::connect(server.addr(), fast_backoff());

    let conn = tokio::time::timeout(
        WAIT,
        create_client_connection(
            Arc::new(ServiceRegistry::new()),
            &[],
            transport.clone(),
            events,
            ClientConnectionOptions::new().with_client_id("C1"),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(conn.channel.id(), "C1:RPCService");

    let echo = conn.center.get_rpc_service("echo");
    let reply = tokio::time::timeout(WAIT, echo.call("say", json!({"text": "hi"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"echo": "hi"}));

    let err = tokio::time::timeout(WAIT, conn.center.get_rpc_service("missing").call("say", json!({})))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, MuxError::Rpc { code: -32601, .. }));

    transport.close();
}

#[tokio::test]
async fn test_bootstrap_registers_multiplexer() {
    let server = start_server("127.0.0.1:0".parse().unwrap()).await;
    let (transport, events) = ReconnectingTcpTransport::connect(server.addr(), fast_backoff());
    let registry = Arc::new(ServiceRegistry::new());

    let conn = tokio::time::timeout(
        WAIT,
        create_client_connection(
            registry.clone(),
            &[],
            transport.clone(),
            events,
            ClientConnectionOptions::new(),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    let registered = registry
        .get::<chanmux_core::ChannelMultiplexer>(&chanmux_core::ChannelConfig::MULTIPLEXER_TOKEN.into())
        .unwrap();
    assert_eq!(registered.client_id(), conn.multiplexer.client_id());

    transport.close();
}

#[tokio::test]
async fn test_rpc_recovers_after_server_restart() {
    let mut server = start_server("127.0.0.1:0".parse().unwrap()).await;
    let addr = server.addr();
    let (transport, events) = ReconnectingTcpTransport::connect(addr, fast_backoff());

    let reconnects = Arc::new(AtomicUsize::new(0));
    let counter = reconnects.clone();
    let conn = tokio::time::timeout(
        WAIT,
        create_client_connection(
            Arc::new(ServiceRegistry::new()),
            &[],
            transport.clone(),
            events,
            ClientConnectionOptions::new()
                .with_client_id("C1")
                .with_on_reconnect(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        ),
    )
    .await
    .unwrap()
    .unwrap();
    let mut lifecycle = conn.multiplexer.subscribe();
    let echo = conn.center.get_rpc_service("echo");
    echo.call("say", json!({"text": "before"})).await.unwrap();

    server.shutdown();
    drop(server);
    // The old listener is released once its accept task stops
    let _server = tokio::time::timeout(WAIT, async {
        loop {
            match ChannelServer::start(addr, echo_acceptor()).await {
                Ok(server) => break server,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
    })
    .await
    .expect("could not rebind server address");

    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(ConnectionEvent::ChannelReconnected { id, .. }) = lifecycle.recv().await {
                assert_eq!(id, "C1:RPCService");
                break;
            }
        }
    })
    .await
    .expect("channel was not re-opened");

    assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    let reply = tokio::time::timeout(WAIT, echo.call("say", json!({"text": "after"})))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, json!({"echo": "after"}));

    transport.close();
}
