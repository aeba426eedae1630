//! Rule-based scaling decisions.
//!
//! Every poll cycle the engine evaluates all rules against one snapshot of the fleet
//! and then fires the matching rules' actions in priority order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::model::LoadWeights;

mod engine;
mod rules;

pub use engine::ScalingEngine;
pub use rules::{
    default_distribute_load_rule, default_rules, default_scale_down_rule, default_scale_up_rule,
    RuleCondition, ScalingRule,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub scale_up_priority: u32,
    pub scale_down_priority: u32,
    pub distribute_load_priority: u32,
    /// Scale down fires when the average broker load falls below this.
    pub scale_down_threshold_percent: u32,
    pub weights: LoadWeights,
    pub min_brokers: usize,
    pub max_brokers: usize,
    /// An unfinished scale request stops blocking new ones after this long.
    pub max_scaling_wait_seconds: u64,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        ScalingConfig {
            scale_up_priority: 1,
            scale_down_priority: 2,
            distribute_load_priority: 3,
            scale_down_threshold_percent: 50,
            weights: LoadWeights::default(),
            min_brokers: 1,
            max_brokers: 16,
            max_scaling_wait_seconds: 300,
        }
    }
}

impl ScalingConfig {
    pub fn max_scaling_wait(&self) -> Duration {
        Duration::from_secs(self.max_scaling_wait_seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    DistributeLoad,
}

impl fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalingAction::ScaleUp => write!(f, "scale_up"),
            ScalingAction::ScaleDown => write!(f, "scale_down"),
            ScalingAction::DistributeLoad => write!(f, "distribute_load"),
        }
    }
}

/// Receives the actions fired by the scaling engine.
#[async_trait]
pub trait ScalingEventListener: Send + Sync {
    async fn scale_up(&self);
    async fn scale_down(&self);
    async fn distribute_load(&self);
}
