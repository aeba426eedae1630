//! Client-facing routing endpoints multiplexed onto the broker fleet.

use async_trait::async_trait;
use gantry_core::command::Command;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::Result;
use crate::transport::Transport;

mod request_map;
mod sharded;
mod state;

pub use request_map::RequestMap;
pub use sharded::{MultiCallback, Readiness, ShardedMessageDistribution};
pub use state::ConnectionStateRegister;

pub type DistributionId = u64;

/// A logical client connection that needs one transport to every broker.
#[async_trait]
pub trait MessageDistribution: Send + Sync {
    fn id(&self) -> DistributionId;

    /// A new transport to `broker_id` is up. The distribution replays its client
    /// state onto it before reporting success.
    async fn transport_created(&self, broker_id: &str, transport: Arc<dyn Transport>) -> Result<()>;

    async fn transport_destroyed(&self, broker_id: &str);

    /// A command a broker sent back on this distribution's transport.
    async fn on_broker_command(&self, broker_id: &str, command: Command);

    /// Stops the distribution, failing whatever is still waiting on a broker.
    async fn shutdown(&self);
}

/// Where distributions deregister themselves when they stop.
#[async_trait]
pub trait DistributionRegistry: Send + Sync {
    async fn deregister_distribution(&self, id: DistributionId);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    /// How long sends wait for the first broker transport.
    pub readiness_timeout_ms: u64,
    /// Capacity of the async request correlation map.
    pub request_cache_size: usize,
    /// Bound on synchronous requests such as the connection replay.
    pub request_timeout_ms: u64,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        DistributionConfig {
            readiness_timeout_ms: 60_000,
            request_cache_size: 50_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl DistributionConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
