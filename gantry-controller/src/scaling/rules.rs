use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{ScalingAction, ScalingConfig, ScalingEngine};
use crate::controller_metrics::{RULE_EVALUATIONS_TOTAL, RULE_FIRINGS_TOTAL};
use crate::model::ModelSnapshot;

pub type RuleCondition = Box<dyn Fn(&ModelSnapshot) -> bool + Send + Sync>;

/// A condition over a fleet snapshot and the action to fire when it holds.
/// Lower priorities fire first.
pub struct ScalingRule {
    name: String,
    description: String,
    priority: u32,
    action: ScalingAction,
    condition: RuleCondition,
    evaluations: AtomicU64,
    firings: AtomicU64,
}

impl ScalingRule {
    pub fn new<F>(
        name: impl Into<String>,
        description: impl Into<String>,
        priority: u32,
        action: ScalingAction,
        condition: F,
    ) -> Self
    where
        F: Fn(&ModelSnapshot) -> bool + Send + Sync + 'static,
    {
        ScalingRule {
            name: name.into(),
            description: description.into(),
            priority,
            action,
            condition: Box::new(condition),
            evaluations: AtomicU64::new(0),
            firings: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn action(&self) -> ScalingAction {
        self.action
    }

    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::SeqCst)
    }

    pub fn firings(&self) -> u64 {
        self.firings.load(Ordering::SeqCst)
    }

    /// Evaluates the condition. Reads the snapshot only.
    pub fn evaluate_conditions(&self, snapshot: &ModelSnapshot) -> bool {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        metrics::counter!(RULE_EVALUATIONS_TOTAL.name, "rule" => self.name.clone()).increment(1);
        let matched = (self.condition)(snapshot);
        if matched {
            self.firings.fetch_add(1, Ordering::SeqCst);
            metrics::counter!(RULE_FIRINGS_TOTAL.name, "rule" => self.name.clone()).increment(1);
        }
        matched
    }

    /// Fires this rule's action on the engine's listeners.
    pub async fn perform_actions(&self, engine: &ScalingEngine) {
        engine.fire(self.action).await;
    }
}

impl fmt::Debug for ScalingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalingRule")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("action", &self.action)
            .finish()
    }
}

/// Fires when any broker is over a broker or destination limit.
pub fn default_scale_up_rule(priority: u32) -> ScalingRule {
    ScalingRule::new(
        "scale-up",
        "a broker exceeds its connection, destination or per-destination limits",
        priority,
        ScalingAction::ScaleUp,
        |snapshot| snapshot.brokers().iter().any(|b| snapshot.limits_exceeded(b)),
    )
}

/// Fires when there is more than one broker and the average load is under the threshold.
pub fn default_scale_down_rule(priority: u32, threshold_percent: u32) -> ScalingRule {
    ScalingRule::new(
        "scale-down",
        format!("more than one broker and average load below {}%", threshold_percent),
        priority,
        ScalingAction::ScaleDown,
        move |snapshot| {
            snapshot.broker_count() > 1 && snapshot.average_load() < f64::from(threshold_percent)
        },
    )
}

/// Fires when the most loaded broker is over its limits, the least loaded one is not,
/// and at least one destination can move between them.
pub fn default_distribute_load_rule(priority: u32) -> ScalingRule {
    ScalingRule::new(
        "distribute-load",
        "the most loaded broker exceeds its limits while the least loaded does not",
        priority,
        ScalingAction::DistributeLoad,
        |snapshot| {
            if snapshot.broker_count() < 2 {
                return false;
            }
            let (Some(most), Some(least)) = (snapshot.most_loaded(), snapshot.least_loaded()) else {
                return false;
            };
            if most.broker_id == least.broker_id
                || !snapshot.limits_exceeded(most)
                || snapshot.limits_exceeded(least)
            {
                return false;
            }
            let movable = snapshot.movable_destination_count(most, least);
            movable > 0 && !snapshot.hottest_destinations(most, movable).is_empty()
        },
    )
}

pub fn default_rules(config: &ScalingConfig) -> Vec<ScalingRule> {
    vec![
        default_scale_up_rule(config.scale_up_priority),
        default_scale_down_rule(config.scale_down_priority, config.scale_down_threshold_percent),
        default_distribute_load_rule(config.distribute_load_priority),
    ]
}
