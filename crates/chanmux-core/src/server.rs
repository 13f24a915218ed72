//! TCP channel server: the peer side of the multiplexer protocol.
//!
//! Accepts multiplexer connections and, per connection, creates a peer-side
//! [`Channel`] for every `open` request, hands it to a [`ChannelAcceptor`]
//! and acknowledges it with `ready`.
//!
//! # Thread Safety
//!
//! Each connection runs on its own spawned task with a separate writer task
//! fed by an unbounded queue, so channel sends never block. A connection's
//! channel map is owned by its reader loop and never shared.

use crate::channel::{Channel, SendFn};
use crate::codec::{decode, Envelope};
use crate::config::TransportConfig;
use crate::transport::frame::{read_frame, write_frame};
use crate::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Receives every channel a client opens, before it is acknowledged.
///
/// Register the channel's message handler here; data the client sends after
/// `ready` is delivered straight to it.
pub trait ChannelAcceptor: Send + Sync + 'static {
    fn accept(&self, channel: Channel);
}

impl<F> ChannelAcceptor for F
where
    F: Fn(Channel) + Send + Sync + 'static,
{
    fn accept(&self, channel: Channel) {
        self(channel)
    }
}

/// Handle to a running channel server. Dropping it stops the server.
pub struct ChannelServerHandle {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    clients: Arc<AtomicUsize>,
    accept_task: Option<JoinHandle<()>>,
}

impl ChannelServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Clients currently connected.
    pub fn active_connections(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Stop the listener and close every client's channels. Idempotent.
    pub fn shutdown(&mut self) {
        self.stop_tx.send_replace(true);
    }
}

impl Drop for ChannelServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// One admitted client. Releases its place in the client count when dropped.
struct ClientSlot {
    clients: Arc<AtomicUsize>,
}

impl ClientSlot {
    /// Take a place if fewer than the maximum number of clients are connected.
    fn claim(clients: &Arc<AtomicUsize>) -> Option<Self> {
        clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < TransportConfig::MAX_SERVER_CONNECTIONS).then_some(count + 1)
            })
            .ok()
            .map(|_| ClientSlot {
                clients: clients.clone(),
            })
    }
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Channel server listening for multiplexer clients.
pub struct ChannelServer;

impl ChannelServer {
    /// Bind `addr` and serve clients on background tasks until the returned
    /// handle is shut down or dropped.
    pub async fn start(
        addr: SocketAddr,
        acceptor: Arc<dyn ChannelAcceptor>,
    ) -> Result<ChannelServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Serving channels on {}", local_addr);

        let (stop_tx, stop_rx) = watch::channel(false);
        let clients = Arc::new(AtomicUsize::new(0));
        let accept_task = tokio::spawn(Self::accept_clients(
            listener,
            acceptor,
            stop_rx,
            clients.clone(),
        ));

        Ok(ChannelServerHandle {
            local_addr,
            stop_tx,
            clients,
            accept_task: Some(accept_task),
        })
    }

    async fn accept_clients(
        listener: TcpListener,
        acceptor: Arc<dyn ChannelAcceptor>,
        mut stop_rx: watch::Receiver<bool>,
        clients: Arc<AtomicUsize>,
    ) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = stop_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Failed to accept client: {}", e);
                        continue;
                    }
                },
            };

            let Some(slot) = ClientSlot::claim(&clients) else {
                warn!(
                    "Turning away {}: {} clients already connected",
                    peer_addr,
                    TransportConfig::MAX_SERVER_CONNECTIONS
                );
                continue;
            };

            let acceptor = acceptor.clone();
            let stop_rx = stop_rx.clone();
            tokio::spawn(async move {
                let _slot = slot;
                debug!("Client {} connected", peer_addr);
                match Self::serve_client(stream, acceptor.as_ref(), stop_rx).await {
                    Ok(()) => debug!("Client {} disconnected", peer_addr),
                    Err(e) => debug!("Client {} dropped: {}", peer_addr, e),
                }
            });
        }
        info!("Channel server stopped accepting clients");
    }

    /// Read frames from one client until it leaves or the server stops. All
    /// of the client's channels are closed on the way out.
    async fn serve_client(
        stream: TcpStream,
        acceptor: &dyn ChannelAcceptor,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let outbound = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("Dropping outbound frames after write failure: {}", e);
                    break;
                }
            }
        });

        let mut session = Session {
            client_id: None,
            channels: HashMap::new(),
            out_tx,
        };

        let (code, reason, result) = loop {
            let frame = tokio::select! {
                frame = read_frame(&mut reader) => frame,
                _ = stop_rx.changed() => {
                    break (TransportConfig::GOING_AWAY_CODE, "server shutting down".to_string(), Ok(()));
                }
            };

            match frame {
                Ok(Some(text)) => session.handle_frame(&text, acceptor),
                Ok(None) => {
                    break (TransportConfig::ABNORMAL_CLOSE_CODE, "connection closed by client".to_string(), Ok(()));
                }
                Err(e) => break (TransportConfig::ABNORMAL_CLOSE_CODE, e.to_string(), Err(e)),
            }
        };
        session.close_all(code, &reason);

        // Channel close hooks may still hold queue senders
        drop(session);
        outbound.abort();
        result
    }
}

/// Per-connection state owned by the reader loop.
struct Session {
    client_id: Option<String>,
    channels: HashMap<String, Channel>,
    out_tx: mpsc::UnboundedSender<String>,
}

impl Session {
    fn channel_send(&self) -> SendFn {
        let out_tx = self.out_tx.clone();
        Arc::new(move |frame: String| {
            if out_tx.send(frame).is_err() {
                debug!("Connection writer gone, dropping frame");
            }
        })
    }

    fn handle_frame(&mut self, text: &str, acceptor: &dyn ChannelAcceptor) {
        let envelope = match decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                return;
            }
        };

        match envelope {
            Envelope::Client { client_id } => {
                info!("Client {} connected", client_id);
                self.client_id = Some(client_id);
            }
            Envelope::Heartbeat { client_id } => {
                trace!("Heartbeat from {}", client_id);
            }
            Envelope::Open { id, path } => {
                let channel = Channel::new(id.clone(), path.as_str(), self.channel_send());
                if let Some(previous) = self.channels.insert(id.clone(), channel.clone()) {
                    debug!("Channel {} re-opened", id);
                    previous.close(TransportConfig::NORMAL_CLOSE_CODE, "replaced");
                }
                debug!(
                    "Client {} opened channel {} ({})",
                    self.client_id.as_deref().unwrap_or("<unknown>"),
                    id,
                    path
                );
                acceptor.accept(channel.clone());
                channel.acknowledge_open();
            }
            Envelope::Ready { id } => {
                debug!("Ignoring ready for {} from client", id);
            }
            envelope @ Envelope::Data { .. } => self.route(envelope),
            envelope @ Envelope::Close { .. } => {
                if let Some(id) = envelope.channel_id() {
                    let id = id.to_string();
                    self.route(envelope);
                    self.channels.remove(&id);
                }
            }
        }
    }

    fn route(&self, envelope: Envelope) {
        let Some(id) = envelope.channel_id() else {
            return;
        };
        match self.channels.get(id) {
            Some(channel) => channel.handle_message(envelope),
            None => warn!("Channel {} not found, dropping {} envelope", id, envelope.kind()),
        }
    }

    fn close_all(&mut self, code: u16, reason: &str) {
        for (_, channel) in self.channels.drain() {
            channel.close(code, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn connect(addr: SocketAddr) -> TcpStream {
        TcpStream::connect(addr).await.unwrap()
    }

    async fn send(stream: &mut TcpStream, envelope: Envelope) {
        write_frame(stream, &encode(&envelope).unwrap()).await.unwrap();
    }

    async fn recv(stream: &mut TcpStream) -> Envelope {
        let frame = tokio::time::timeout(Duration::from_secs(5), read_frame(stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode(&frame).unwrap()
    }

    fn echo_acceptor() -> Arc<dyn ChannelAcceptor> {
        Arc::new(|channel: Channel| {
            let reply = channel.clone();
            channel.on_message(move |content| reply.send(format!("echo: {}", content)));
        })
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut handle = ChannelServer::start(addr, echo_acceptor()).await.unwrap();

        assert!(handle.addr().port() > 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn test_open_is_acknowledged_and_data_routed() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handle = ChannelServer::start(addr, echo_acceptor()).await.unwrap();
        let mut stream = connect(handle.addr()).await;

        send(&mut stream, Envelope::Client { client_id: "C1".into() }).await;
        send(
            &mut stream,
            Envelope::Open {
                id: "C1:Echo".into(),
                path: "Echo".into(),
            },
        )
        .await;
        assert_eq!(recv(&mut stream).await, Envelope::Ready { id: "C1:Echo".into() });

        send(
            &mut stream,
            Envelope::Data {
                id: "C1:Echo".into(),
                content: "hi".into(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut stream).await,
            Envelope::Data {
                id: "C1:Echo".into(),
                content: "echo: hi".into()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handle = ChannelServer::start(addr, echo_acceptor()).await.unwrap();
        let mut stream = connect(handle.addr()).await;

        write_frame(&mut stream, "not json").await.unwrap();
        send(
            &mut stream,
            Envelope::Data {
                id: "C1:Nowhere".into(),
                content: "lost".into(),
            },
        )
        .await;
        send(
            &mut stream,
            Envelope::Open {
                id: "C1:Echo".into(),
                path: "Echo".into(),
            },
        )
        .await;

        assert_eq!(recv(&mut stream).await, Envelope::Ready { id: "C1:Echo".into() });
    }

    #[tokio::test]
    async fn test_disconnect_closes_channels() {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = closes.clone();
        let acceptor: Arc<dyn ChannelAcceptor> = Arc::new(move |channel: Channel| {
            let sink = sink.clone();
            channel.on_close(move |code, _| sink.lock().unwrap().push(code));
        });

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let handle = ChannelServer::start(addr, acceptor).await.unwrap();
        let mut stream = connect(handle.addr()).await;
        send(
            &mut stream,
            Envelope::Open {
                id: "C1:Echo".into(),
                path: "Echo".into(),
            },
        )
        .await;
        recv(&mut stream).await;
        drop(stream);

        for _ in 0..100 {
            if !closes.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            *closes.lock().unwrap(),
            vec![TransportConfig::ABNORMAL_CLOSE_CODE]
        );
    }

    #[test]
    fn test_client_slots_are_capped_and_released() {
        let clients = Arc::new(AtomicUsize::new(0));
        let slots: Vec<ClientSlot> = (0..TransportConfig::MAX_SERVER_CONNECTIONS)
            .map(|_| ClientSlot::claim(&clients).unwrap())
            .collect();

        assert!(ClientSlot::claim(&clients).is_none());
        assert_eq!(clients.load(Ordering::SeqCst), TransportConfig::MAX_SERVER_CONNECTIONS);

        drop(slots);
        assert_eq!(clients.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_channels_and_releases_clients() {
        let closes = Arc::new(Mutex::new(Vec::new()));
        let sink = closes.clone();
        let acceptor: Arc<dyn ChannelAcceptor> = Arc::new(move |channel: Channel| {
            let sink = sink.clone();
            channel.on_close(move |code, _| sink.lock().unwrap().push(code));
        });

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let mut handle = ChannelServer::start(addr, acceptor).await.unwrap();
        let mut stream = connect(handle.addr()).await;
        send(
            &mut stream,
            Envelope::Open {
                id: "C1:Echo".into(),
                path: "Echo".into(),
            },
        )
        .await;
        recv(&mut stream).await;
        assert_eq!(handle.active_connections(), 1);

        handle.shutdown();
        for _ in 0..100 {
            if handle.active_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(handle.active_connections(), 0);
        assert_eq!(*closes.lock().unwrap(), vec![TransportConfig::GOING_AWAY_CODE]);
    }
}
