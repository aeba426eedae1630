use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use gantry_core::command::{Command, CommandKind, WireFormatInfo};
use gantry_core::wire::FrameCodec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use super::{response_result, Connector, Transport, TransportListener, TransportOptions};
use crate::errors::{GantryError, Result};

/// Builds `TcpTransport`s for `tcp://host:port` broker URIs.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        options: &TransportOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>> {
        let address = socket_address(&options.uri)?;
        let mut last_error = None;

        // one initial attempt plus the configured reconnects
        for attempt in 0..=options.max_reconnect_attempts {
            match TcpTransport::open(&address, options, listener.clone()).await {
                Ok(transport) => return Ok(transport),
                Err(e) => {
                    warn!(uri = %options, attempt, error = %e, "broker transport connect failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| GantryError::Transport(format!("unable to connect to {}", options))))
    }
}

fn socket_address(uri: &str) -> Result<String> {
    let without_scheme = uri.strip_prefix("tcp://").unwrap_or(uri);
    let address = without_scheme.split('?').next().unwrap_or_default();
    if address.is_empty() {
        return Err(GantryError::Transport(format!("invalid broker uri: {}", uri)));
    }
    Ok(address.to_string())
}

struct Connection {
    connected: AtomicBool,
    exception_fired: AtomicBool,
    pending: DashMap<u32, oneshot::Sender<Command>>,
    listener: Arc<dyn TransportListener>,
}

impl Connection {
    async fn lost(&self, error: GantryError) {
        if self.exception_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        // dropping the senders wakes every waiting request with an error
        self.pending.clear();
        self.listener.on_exception(error).await;
    }
}

/// Framed TCP connection to one broker.
///
/// A writer task drains the outbound queue into the socket. A reader task completes
/// pending requests, answers keep-alives and hands every other command to the listener.
pub struct TcpTransport {
    remote: String,
    outbound: mpsc::UnboundedSender<Command>,
    connection: Arc<Connection>,
    disposed: AtomicBool,
    next_command_id: AtomicU32,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    async fn open(
        address: &str,
        options: &TransportOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, FrameCodec::default());

        // the transport only counts as started once both sides agreed on a wire format
        framed
            .send(Command::new(
                0,
                CommandKind::WireFormatInfo(WireFormatInfo {
                    cache_enabled: options.wire_format_cache_enabled,
                    ..Default::default()
                }),
            ))
            .await?;
        let peer = tokio::time::timeout(options.handshake_timeout, framed.next())
            .await
            .map_err(|_| GantryError::Transport(format!("wire format negotiation with {} timed out", address)))?;
        match peer {
            Some(Ok(Command {
                kind: CommandKind::WireFormatInfo(info),
                ..
            })) => {
                debug!(remote = %address, version = info.version, "wire format negotiated");
            }
            Some(Ok(other)) => {
                return Err(GantryError::Transport(format!(
                    "expected WireFormatInfo from {}, got {}",
                    address, other
                )))
            }
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(GantryError::Transport(format!(
                    "{} closed the connection during negotiation",
                    address
                )))
            }
        }

        let (mut sink, mut stream) = framed.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Command>();
        let connection = Arc::new(Connection {
            connected: AtomicBool::new(true),
            exception_fired: AtomicBool::new(false),
            pending: DashMap::new(),
            listener,
        });

        let writer_connection = connection.clone();
        tokio::spawn(async move {
            while let Some(command) = outbound_rx.recv().await {
                let shutdown = matches!(command.kind, CommandKind::ShutdownInfo);
                if let Err(e) = sink.send(command).await {
                    writer_connection.lost(e.into()).await;
                    return;
                }
                if shutdown {
                    let _ = sink.close().await;
                    return;
                }
            }
        });

        let reader_connection = connection.clone();
        let keep_alive = outbound.clone();
        let remote = address.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let command = match frame {
                    Ok(command) => command,
                    Err(e) => {
                        reader_connection.lost(e.into()).await;
                        return;
                    }
                };
                trace!(remote = %remote, command = %command, "received from broker");
                match command.kind {
                    CommandKind::KeepAliveInfo => {
                        if command.response_required {
                            let _ = keep_alive.send(Command::new(0, CommandKind::KeepAliveInfo));
                        }
                    }
                    _ if command.is_response() => {
                        let waiting = command
                            .correlation_id()
                            .and_then(|id| reader_connection.pending.remove(&id));
                        match waiting {
                            Some((_, tx)) => {
                                let _ = tx.send(command);
                            }
                            None => reader_connection.listener.on_command(command).await,
                        }
                    }
                    _ => reader_connection.listener.on_command(command).await,
                }
            }
            reader_connection
                .lost(GantryError::Transport(format!("{} closed the connection", remote)))
                .await;
        });

        Ok(Arc::new(TcpTransport {
            remote: address.to_string(),
            outbound,
            connection,
            disposed: AtomicBool::new(false),
            // ids below this are left to the client commands forwarded with `oneway`
            next_command_id: AtomicU32::new(1 << 30),
            reader: Mutex::new(Some(reader)),
        }))
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn oneway(&self, command: Command) -> Result<()> {
        if !self.is_connected() {
            return Err(GantryError::Transport(format!("transport to {} is not connected", self.remote)));
        }
        self.outbound
            .send(command)
            .map_err(|_| GantryError::Transport(format!("transport to {} is closed", self.remote)))
    }

    async fn request(&self, mut command: Command, timeout: Duration) -> Result<Command> {
        let id = self.next_command_id.fetch_add(1, Ordering::SeqCst);
        command.command_id = id;
        command.response_required = true;

        let (tx, rx) = oneshot::channel();
        self.connection.pending.insert(id, tx);
        if let Err(e) = self.oneway(command).await {
            self.connection.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response_result(response),
            Ok(Err(_)) => Err(GantryError::Transport(format!(
                "connection to {} lost while awaiting response",
                self.remote
            ))),
            Err(_) => {
                self.connection.pending.remove(&id);
                Err(GantryError::Transport(format!(
                    "request to {} timed out after {:?}",
                    self.remote, timeout
                )))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connection.connected.load(Ordering::SeqCst) && !self.is_disposed()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        // a deliberate stop is not a connection loss
        self.connection.exception_fired.store(true, Ordering::SeqCst);
        let _ = self.outbound.send(Command::new(0, CommandKind::ShutdownInfo));
        self.connection.connected.store(false, Ordering::SeqCst);
        self.connection.pending.clear();
        if let Some(reader) = self.reader.lock().await.take() {
            reader.abort();
        }
        debug!(remote = %self.remote, "broker transport stopped");
    }

    fn remote_address(&self) -> &str {
        &self.remote
    }
}

#[cfg(test)]
#[path = "tcp_test.rs"]
mod tcp_test;
