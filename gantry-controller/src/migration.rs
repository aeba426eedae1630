//! Drains destinations from one broker and republishes them on another.
//!
//! Migration is at-least-once with best-effort ordering. Messages already queued on
//! the source are republished to the target before routing switches, but nothing
//! orders them against messages that reach the target concurrently, and a failed
//! migration may leave some messages already copied.

use async_trait::async_trait;
use gantry_core::command::Message;
use gantry_core::Destination;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::controller_metrics::MIGRATED_MESSAGES_TOTAL;
use crate::errors::{GantryError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// A destination is drained once no message arrives within this window.
    pub receive_timeout_ms: u64,
    /// Overall bound on one batch of destinations.
    pub copy_timeout_seconds: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        MigrationConfig {
            receive_timeout_ms: 1000,
            copy_timeout_seconds: 60,
        }
    }
}

impl MigrationConfig {
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_seconds)
    }
}

/// Client-level connection to a broker used for draining and republishing.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Box<dyn BrokerSession>>;
}

#[async_trait]
pub trait BrokerSession: Send {
    /// Next queued message, or `None` if nothing arrived within `timeout`.
    async fn receive(&mut self, destination: &Destination, timeout: Duration) -> Result<Option<Message>>;

    async fn send(&mut self, message: Message) -> Result<()>;

    /// Deletes an empty destination from the broker.
    async fn remove_destination(&mut self, destination: &Destination) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    /// Republish and leave the drained destination on the source.
    Copy,
    /// Republish, then delete the drained destination from the source.
    Move,
}

/// Shared progress of a running worker.
#[derive(Debug, Default)]
pub struct WorkerProgress {
    total: usize,
    completed: AtomicUsize,
    messages: AtomicU64,
    cancelled: AtomicBool,
    completed_destinations: Mutex<Vec<Destination>>,
    error: Mutex<Option<String>>,
}

impl WorkerProgress {
    fn new(total: usize) -> Self {
        WorkerProgress {
            total,
            ..Default::default()
        }
    }

    pub fn percent_complete(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.completed.load(Ordering::SeqCst) * 100 / self.total) as u32
    }

    pub fn messages_moved(&self) -> u64 {
        self.messages.load(Ordering::SeqCst)
    }

    pub async fn completed_destinations(&self) -> Vec<Destination> {
        self.completed_destinations.lock().await.clone()
    }

    pub async fn error(&self) -> Option<String> {
        self.error.lock().await.clone()
    }

    /// Asks the worker to stop after the message in hand.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub destinations: Vec<Destination>,
    pub messages: u64,
}

/// Short-lived worker draining a list of destinations from `from_uri` into `to_uri`.
pub struct DestinationWorker {
    kind: MigrationKind,
    connector: Arc<dyn BrokerConnector>,
    from_uri: String,
    to_uri: String,
    destinations: Vec<Destination>,
    receive_timeout: Duration,
    progress: Arc<WorkerProgress>,
}

impl DestinationWorker {
    pub fn copy(
        connector: Arc<dyn BrokerConnector>,
        from_uri: impl Into<String>,
        to_uri: impl Into<String>,
        destinations: Vec<Destination>,
        receive_timeout: Duration,
    ) -> Self {
        Self::new(MigrationKind::Copy, connector, from_uri, to_uri, destinations, receive_timeout)
    }

    pub fn moving(
        connector: Arc<dyn BrokerConnector>,
        from_uri: impl Into<String>,
        to_uri: impl Into<String>,
        destinations: Vec<Destination>,
        receive_timeout: Duration,
    ) -> Self {
        Self::new(MigrationKind::Move, connector, from_uri, to_uri, destinations, receive_timeout)
    }

    pub fn new(
        kind: MigrationKind,
        connector: Arc<dyn BrokerConnector>,
        from_uri: impl Into<String>,
        to_uri: impl Into<String>,
        destinations: Vec<Destination>,
        receive_timeout: Duration,
    ) -> Self {
        let progress = Arc::new(WorkerProgress::new(destinations.len()));
        DestinationWorker {
            kind,
            connector,
            from_uri: from_uri.into(),
            to_uri: to_uri.into(),
            destinations,
            receive_timeout,
            progress,
        }
    }

    pub fn progress(&self) -> Arc<WorkerProgress> {
        self.progress.clone()
    }

    /// Runs to completion. Any error fails the whole worker. Both connections are
    /// closed whatever the outcome.
    pub async fn run(self) -> Result<MigrationReport> {
        let mut source = self.connector.connect(&self.from_uri).await?;
        let mut target = match self.connector.connect(&self.to_uri).await {
            Ok(target) => target,
            Err(e) => {
                close_quietly(source.as_mut(), &self.from_uri).await;
                return Err(e);
            }
        };

        let outcome = self.drain_all(source.as_mut(), target.as_mut()).await;

        close_quietly(source.as_mut(), &self.from_uri).await;
        close_quietly(target.as_mut(), &self.to_uri).await;

        match outcome {
            Ok(()) => Ok(MigrationReport {
                destinations: self.progress.completed_destinations().await,
                messages: self.progress.messages_moved(),
            }),
            Err(e) => {
                *self.progress.error.lock().await = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn drain_all(&self, source: &mut dyn BrokerSession, target: &mut dyn BrokerSession) -> Result<()> {
        for destination in &self.destinations {
            let mut moved = 0u64;
            loop {
                if self.progress.is_cancelled() {
                    return Err(GantryError::MigrationFailed(format!(
                        "migration of {} cancelled",
                        destination
                    )));
                }
                let Some(mut message) = source.receive(destination, self.receive_timeout).await? else {
                    break;
                };
                message.destination = destination.clone();
                if let Err(e) = target.send(message.clone()).await {
                    // hand the message back so a failed migration loses nothing
                    if let Err(restore) = source.send(message).await {
                        warn!(destination = %destination, error = %restore, "message could not be restored to the source");
                    }
                    return Err(e);
                }
                moved += 1;
                self.progress.messages.fetch_add(1, Ordering::SeqCst);
                metrics::counter!(MIGRATED_MESSAGES_TOTAL.name).increment(1);
            }

            if self.kind == MigrationKind::Move {
                source.remove_destination(destination).await?;
            }

            self.progress.completed.fetch_add(1, Ordering::SeqCst);
            self.progress
                .completed_destinations
                .lock()
                .await
                .push(destination.clone());
            debug!(
                destination = %destination,
                messages = moved,
                percent_complete = self.progress.percent_complete(),
                "destination drained"
            );
        }
        info!(
            from = %self.from_uri,
            to = %self.to_uri,
            destinations = self.destinations.len(),
            messages = self.progress.messages_moved(),
            kind = ?self.kind,
            "destination worker finished"
        );
        Ok(())
    }
}

async fn close_quietly(session: &mut dyn BrokerSession, uri: &str) {
    if let Err(e) = session.close().await {
        warn!(uri = %uri, error = %e, "failed to close migration connection");
    }
}
