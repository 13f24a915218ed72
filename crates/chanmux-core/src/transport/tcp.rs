//! Reconnecting TCP transport.
//!
//! A background driver task owns the socket. It connects (with a timeout),
//! emits `Open`, forwards every inbound frame as `Message`, and on loss emits
//! `Close` with code 1006 before reconnecting with exponential backoff.
//! Outbound frames wait in an unbounded queue while disconnected; a frame
//! whose write failed is retried first on the next connection.
//!
//! # Thread Safety
//!
//! Reading happens on a dedicated per-connection task so a partially read
//! frame is never abandoned by a `select!` branch. The driver only selects on
//! cancel-safe futures (queue receive, shutdown watch, reader-loss oneshot).

use super::backoff::BackoffConfig;
use super::frame::{read_frame, write_frame};
use super::{Transport, TransportEvent, TransportEvents};
use crate::config::TransportConfig;
use crate::{MuxError, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// TCP transport that reconnects on its own.
pub struct ReconnectingTcpTransport {
    addr: SocketAddr,
    open: Arc<AtomicBool>,
    outbound_tx: mpsc::UnboundedSender<String>,
    shutdown_tx: watch::Sender<bool>,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

enum ConnectionEnd {
    Shutdown,
    Lost(String),
}

impl ReconnectingTcpTransport {
    /// Start connecting to `addr` in the background.
    ///
    /// Returns immediately; the first `Open` event arrives once the socket is up.
    pub fn connect(addr: SocketAddr, backoff: BackoffConfig) -> (Arc<Self>, TransportEvents) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(false));

        let task_handle = tokio::spawn(drive(
            addr,
            backoff,
            open.clone(),
            outbound_rx,
            events_tx,
            shutdown_rx,
        ));

        (
            Arc::new(Self {
                addr,
                open,
                outbound_tx,
                shutdown_tx,
                task_handle: Mutex::new(Some(task_handle)),
            }),
            events_rx,
        )
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop reconnecting and close the socket. Emits a final `Close` (1000).
    pub fn close(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Transport for ReconnectingTcpTransport {
    fn send(&self, frame: String) -> Result<()> {
        self.outbound_tx
            .send(frame)
            .map_err(|_| MuxError::TransportClosed {
                reason: format!("transport to {} shut down", self.addr),
            })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for ReconnectingTcpTransport {
    fn drop(&mut self) {
        self.close();
        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

async fn drive(
    addr: SocketAddr,
    backoff: BackoffConfig,
    open: Arc<AtomicBool>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    let mut in_flight: Option<String> = None;

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let attempt = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr));
        let result = tokio::select! {
            _ = shutdown_rx.changed() => break,
            result = attempt => result,
        };

        match result {
            Ok(Ok(stream)) => {
                failures = 0;
                info!("Transport connected to {}", addr);
                open.store(true, Ordering::SeqCst);
                let _ = events_tx.send(TransportEvent::Open);

                let end = run_connection(
                    stream,
                    &mut outbound_rx,
                    &mut in_flight,
                    &events_tx,
                    &mut shutdown_rx,
                )
                .await;
                open.store(false, Ordering::SeqCst);

                match end {
                    ConnectionEnd::Shutdown => break,
                    ConnectionEnd::Lost(reason) => {
                        warn!("Transport to {} lost: {}", addr, reason);
                        let _ = events_tx.send(TransportEvent::Close {
                            code: TransportConfig::ABNORMAL_CLOSE_CODE,
                            reason,
                        });
                    }
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                debug!("Connect to {} failed (attempt {}): {}", addr, failures, e);
                let _ = events_tx.send(TransportEvent::Error(format!(
                    "connect to {} failed: {}",
                    addr, e
                )));
            }
            Err(_) => {
                failures += 1;
                debug!("Connect to {} timed out (attempt {})", addr, failures);
                let _ = events_tx.send(TransportEvent::Error(format!(
                    "connect to {} timed out after {:?}",
                    addr,
                    TransportConfig::CONNECT_TIMEOUT
                )));
            }
        }

        if !backoff.allows_attempt(failures) {
            warn!("Giving up on {} after {} failed attempts", addr, failures);
            let _ = events_tx.send(TransportEvent::Close {
                code: TransportConfig::ABNORMAL_CLOSE_CODE,
                reason: format!("gave up after {} failed attempts", failures),
            });
            return;
        }

        let delay = backoff.calculate_delay(failures.saturating_sub(1));
        debug!("Reconnecting to {} in {:?}", addr, delay);
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    open.store(false, Ordering::SeqCst);
    info!("Transport to {} closed", addr);
    let _ = events_tx.send(TransportEvent::Close {
        code: TransportConfig::NORMAL_CLOSE_CODE,
        reason: "transport closed".to_string(),
    });
}

async fn run_connection(
    stream: TcpStream,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    in_flight: &mut Option<String>,
    events_tx: &mpsc::UnboundedSender<TransportEvent>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectionEnd {
    let (mut reader, mut writer) = stream.into_split();

    let (lost_tx, mut lost_rx) = oneshot::channel::<String>();
    let reader_events = events_tx.clone();
    let reader_task = tokio::spawn(async move {
        let reason = loop {
            match read_frame(&mut reader).await {
                Ok(Some(text)) => {
                    if reader_events.send(TransportEvent::Message(text)).is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
                Ok(None) => break "connection closed by peer".to_string(),
                Err(e) => break e.to_string(),
            }
        };
        let _ = lost_tx.send(reason);
    });

    let end = loop {
        if let Some(frame) = in_flight.as_deref() {
            if let Err(e) = write_frame(&mut writer, frame).await {
                break ConnectionEnd::Lost(e.to_string());
            }
            *in_flight = None;
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break ConnectionEnd::Shutdown,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => *in_flight = Some(frame),
                // Every transport handle is gone
                None => break ConnectionEnd::Shutdown,
            },
            reason = &mut lost_rx => {
                break ConnectionEnd::Lost(
                    reason.unwrap_or_else(|_| "reader stopped".to_string()),
                );
            }
        }
    };

    reader_task.abort();
    end
}
