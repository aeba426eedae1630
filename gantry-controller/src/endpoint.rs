//! The client-facing listener. Every accepted connection becomes one sharded message
//! distribution registered with the broker control.

use futures::{SinkExt, StreamExt};
use gantry_core::command::{Command, CommandKind, WireFormatInfo};
use gantry_core::wire::FrameCodec;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::control::BrokerControl;
use crate::distribution::{DistributionConfig, DistributionRegistry, ShardedMessageDistribution};
use crate::errors::{GantryError, Result};
use crate::interceptor::MessageInterceptorRegistry;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct MqEndpoint {
    control: Arc<BrokerControl>,
    interceptors: Arc<MessageInterceptorRegistry>,
    config: DistributionConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    next_distribution: AtomicU64,
}

impl MqEndpoint {
    pub async fn bind(
        addr: &str,
        control: Arc<BrokerControl>,
        interceptors: Arc<MessageInterceptorRegistry>,
        config: DistributionConfig,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(MqEndpoint {
            control,
            interceptors,
            config,
            local_addr,
            listener: Mutex::new(Some(listener)),
            acceptor: Mutex::new(None),
            next_distribution: AtomicU64::new(1),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn start(self: &Arc<Self>) {
        let Some(listener) = self.listener.lock().await.take() else {
            return;
        };
        let endpoint = Arc::clone(self);
        let acceptor = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        let endpoint = endpoint.clone();
                        tokio::spawn(async move {
                            if let Err(e) = endpoint.serve(socket, peer).await {
                                debug!(peer = %peer, error = %e, "client connection ended");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept client connection"),
                }
            }
        });
        *self.acceptor.lock().await = Some(acceptor);
        info!(addr = %self.local_addr, "client endpoint listening");
    }

    /// Stops accepting. Open client connections end with the broker control.
    pub async fn stop(&self) {
        if let Some(acceptor) = self.acceptor.lock().await.take() {
            acceptor.abort();
        }
    }

    async fn serve(&self, socket: TcpStream, peer: SocketAddr) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, FrameCodec::default());
        let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, framed.next())
            .await
            .map_err(|_| GantryError::Transport(format!("{} sent no wire format", peer)))?;
        match hello {
            Some(Ok(Command {
                kind: CommandKind::WireFormatInfo(info),
                ..
            })) => trace!(peer = %peer, version = info.version, "client wire format"),
            Some(Ok(other)) => {
                return Err(GantryError::Transport(format!(
                    "expected WireFormatInfo from {}, got {}",
                    peer, other
                )))
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(()),
        }
        framed
            .send(Command::new(0, CommandKind::WireFormatInfo(WireFormatInfo::default())))
            .await?;

        let (client_tx, mut client_rx) = mpsc::unbounded_channel::<Command>();
        let errors = client_tx.clone();
        let id = self.next_distribution.fetch_add(1, Ordering::SeqCst);
        let registry: Arc<dyn DistributionRegistry> = self.control.clone();
        let distribution = Arc::new(
            ShardedMessageDistribution::new(id, self.control.model().clone(), self.config.clone())
                .with_client(client_tx)
                .with_registry(Arc::downgrade(&registry)),
        );
        self.control.register_distribution(distribution.clone()).await;
        info!(peer = %peer, distribution = id, "client connected");

        let (mut sink, mut stream) = framed.split();
        let writer = tokio::spawn(async move {
            while let Some(command) = client_rx.recv().await {
                if let Err(e) = sink.send(command).await {
                    debug!(error = %e, "client write failed");
                    return;
                }
            }
        });

        while let Some(frame) = stream.next().await {
            let command = match frame {
                Ok(command) => command,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "undecodable client frame, closing");
                    break;
                }
            };
            let Some(command) = self.interceptors.apply(command).await else {
                continue;
            };
            let (command_id, response_required) = (command.command_id, command.response_required);
            if let Err(e) = distribution.on_client_command(command).await {
                warn!(distribution = id, error = %e, "client command failed");
                if response_required {
                    let _ = errors.send(Command::exception(command_id, e.to_string()));
                }
            }
            if distribution.is_stopped() {
                break;
            }
        }

        distribution.stop().await;
        drop(errors);
        drop(distribution);
        // let queued replies drain before the socket goes away
        let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        info!(peer = %peer, distribution = id, "client disconnected");
        Ok(())
    }
}
