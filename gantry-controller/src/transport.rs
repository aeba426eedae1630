//! Outbound connections from a client distribution to one broker.

use async_trait::async_trait;
use gantry_core::command::Command;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{GantryError, Result};

mod tcp;
pub use tcp::{TcpConnector, TcpTransport};

/// Options a broker transport is built with.
///
/// The control plane owns reconnection: a transport never retries on its own beyond
/// `max_reconnect_attempts`, and a dead transport is replaced by the next poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub uri: String,
    pub max_reconnect_attempts: u32,
    pub wire_format_cache_enabled: bool,
    pub handshake_timeout: Duration,
}

impl TransportOptions {
    pub fn for_broker(uri: impl Into<String>) -> Self {
        TransportOptions {
            uri: uri.into(),
            max_reconnect_attempts: 0,
            wire_format_cache_enabled: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl Display for TransportOptions {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failover:({}?wireFormat.cacheEnabled={})?maxReconnectAttempts={}",
            self.uri, self.wire_format_cache_enabled, self.max_reconnect_attempts
        )
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends without waiting for a reply.
    async fn oneway(&self, command: Command) -> Result<()>;

    /// Sends with `response_required` set and waits for the correlated response.
    /// An `ExceptionResponse` is returned as `GantryError::Transport`.
    async fn request(&self, command: Command, timeout: Duration) -> Result<Command>;

    fn is_connected(&self) -> bool;

    fn is_disposed(&self) -> bool;

    /// Idempotent.
    async fn stop(&self);

    fn remote_address(&self) -> &str;
}

/// Receives what a broker sends back on a transport.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn on_command(&self, command: Command);

    /// Fired at most once per transport, when the connection is lost.
    async fn on_exception(&self, error: GantryError);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        options: &TransportOptions,
        listener: Arc<dyn TransportListener>,
    ) -> Result<Arc<dyn Transport>>;
}

/// Maps a response command to the caller-facing result of `Transport::request`.
pub(crate) fn response_result(response: Command) -> Result<Command> {
    match &response.kind {
        gantry_core::command::CommandKind::ExceptionResponse { message, .. } => {
            Err(GantryError::Transport(message.clone()))
        }
        _ => Ok(response),
    }
}
