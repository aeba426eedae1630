use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ScalingAction, ScalingEventListener, ScalingRule};
use crate::listeners::{ListenerId, ListenerList};
use crate::model::Model;

/// Evaluates the registered rules against the fleet model once per poll cycle.
pub struct ScalingEngine {
    model: Arc<Model>,
    rules: RwLock<Vec<Arc<ScalingRule>>>,
    listeners: ListenerList<dyn ScalingEventListener>,
}

impl ScalingEngine {
    pub fn new(model: Arc<Model>) -> Self {
        ScalingEngine {
            model,
            rules: RwLock::new(Vec::new()),
            listeners: ListenerList::new(),
        }
    }

    /// Registers a rule. Rules stay sorted by priority; equal priorities keep
    /// registration order.
    pub async fn add_rule(&self, rule: ScalingRule) -> Arc<ScalingRule> {
        let rule = Arc::new(rule);
        let mut rules = self.rules.write().await;
        let at = rules.partition_point(|r| r.priority() <= rule.priority());
        rules.insert(at, rule.clone());
        debug!(rule = %rule.name(), priority = rule.priority(), "scaling rule registered");
        rule
    }

    pub async fn rules(&self) -> Vec<Arc<ScalingRule>> {
        self.rules.read().await.clone()
    }

    pub async fn add_listener(&self, listener: Arc<dyn ScalingEventListener>) -> ListenerId {
        self.listeners.add(listener).await
    }

    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id).await
    }

    /// Delivers `action` to every registered listener.
    pub async fn fire(&self, action: ScalingAction) {
        for listener in self.listeners.snapshot().await {
            match action {
                ScalingAction::ScaleUp => listener.scale_up().await,
                ScalingAction::ScaleDown => listener.scale_down().await,
                ScalingAction::DistributeLoad => listener.distribute_load().await,
            }
        }
    }

    /// Evaluates every rule against one snapshot, then performs the matching rules'
    /// actions in priority order. Returns the actions fired.
    pub async fn process(&self) -> Vec<ScalingAction> {
        let snapshot = self.model.snapshot().await;
        let rules = self.rules().await;

        let matched: Vec<_> = rules
            .into_iter()
            .filter(|rule| rule.evaluate_conditions(&snapshot))
            .collect();

        let mut fired = Vec::with_capacity(matched.len());
        for rule in matched {
            info!(
                rule = %rule.name(),
                action = %rule.action(),
                brokers = snapshot.broker_count(),
                average_load = snapshot.average_load(),
                "scaling rule fired"
            );
            rule.perform_actions(self).await;
            fired.push(rule.action());
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalFleet;
    use crate::migration::MigrationConfig;
    use crate::model::{BrokerModel, BrokerView, LoadPolicy};
    use crate::scaling::ScalingConfig;
    use crate::scheduler::TaskExecutor;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        actions: Mutex<Vec<ScalingAction>>,
        observed_last_rule_evaluations: Mutex<Vec<u64>>,
        last_rule: Mutex<Option<Arc<ScalingRule>>>,
    }

    impl Recorder {
        async fn record(&self, action: ScalingAction) {
            if let Some(rule) = self.last_rule.lock().await.as_ref() {
                self.observed_last_rule_evaluations.lock().await.push(rule.evaluations());
            }
            self.actions.lock().await.push(action);
        }
    }

    #[async_trait]
    impl ScalingEventListener for Recorder {
        async fn scale_up(&self) {
            self.record(ScalingAction::ScaleUp).await;
        }

        async fn scale_down(&self) {
            self.record(ScalingAction::ScaleDown).await;
        }

        async fn distribute_load(&self) {
            self.record(ScalingAction::DistributeLoad).await;
        }
    }

    async fn engine(brokers: usize) -> ScalingEngine {
        let fleet = LocalFleet::with_brokers(brokers).await;
        let model = Arc::new(Model::new(
            LoadPolicy::default(),
            MigrationConfig::default(),
            Arc::new(fleet.clone()),
            Arc::new(TaskExecutor::new("test", 2)),
        ));
        for id in fleet.broker_ids().await {
            let view = BrokerView::new(&id, &id, LocalFleet::uri(&id), Arc::new(fleet.clone()));
            model.add_broker(Arc::new(BrokerModel::new(view, model.policy()))).await;
        }
        ScalingEngine::new(model)
    }

    fn always(name: &str, priority: u32, action: ScalingAction) -> ScalingRule {
        ScalingRule::new(name, "always fires", priority, action, |_| true)
    }

    /// **Test:** Priority order with several matching rules.
    ///
    /// **Expectation:** Actions fire lowest priority first; equal priorities keep
    /// registration order; a non-matching rule fires nothing.
    #[tokio::test]
    async fn matching_rules_fire_in_priority_order() {
        let engine = engine(1).await;
        engine.add_rule(always("distribute", 3, ScalingAction::DistributeLoad)).await;
        engine.add_rule(always("down", 2, ScalingAction::ScaleDown)).await;
        engine.add_rule(always("up", 1, ScalingAction::ScaleUp)).await;
        engine.add_rule(always("rebalance", 2, ScalingAction::DistributeLoad)).await;
        engine
            .add_rule(ScalingRule::new("never", "", 0, ScalingAction::ScaleUp, |_| false))
            .await;

        let names: Vec<_> = engine.rules().await.iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["never", "up", "down", "rebalance", "distribute"]);

        let recorder = Arc::new(Recorder::default());
        engine.add_listener(recorder.clone()).await;
        let fired = engine.process().await;
        assert_eq!(
            fired,
            vec![
                ScalingAction::ScaleUp,
                ScalingAction::ScaleDown,
                ScalingAction::DistributeLoad,
                ScalingAction::DistributeLoad
            ]
        );
        assert_eq!(*recorder.actions.lock().await, fired);
    }

    /// **Test:** Evaluate all, then act.
    ///
    /// **Reason:** A rule's action must not change what later rules see in the same tick.
    ///
    /// **Expectation:** When the first action fires, the last rule has already been
    /// evaluated once.
    #[tokio::test]
    async fn every_rule_is_evaluated_before_any_action() {
        let engine = engine(1).await;
        engine.add_rule(always("first", 1, ScalingAction::ScaleUp)).await;
        let last = engine
            .add_rule(ScalingRule::new("last", "", 9, ScalingAction::ScaleDown, |_| false))
            .await;

        let recorder = Arc::new(Recorder::default());
        *recorder.last_rule.lock().await = Some(last.clone());
        engine.add_listener(recorder.clone()).await;

        engine.process().await;
        assert_eq!(*recorder.observed_last_rule_evaluations.lock().await, vec![1]);
        assert_eq!(last.firings(), 0);
    }

    #[tokio::test]
    async fn removed_listener_never_fires() {
        let engine = engine(1).await;
        engine.add_rule(always("up", 1, ScalingAction::ScaleUp)).await;
        let kept = Arc::new(Recorder::default());
        let removed = Arc::new(Recorder::default());
        engine.add_listener(kept.clone()).await;
        let id = engine.add_listener(removed.clone()).await;
        assert!(engine.remove_listener(id).await);

        engine.process().await;
        assert_eq!(kept.actions.lock().await.len(), 1);
        assert!(removed.actions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn idle_fleet_fires_nothing_with_default_rules() {
        let engine = engine(1).await;
        for rule in crate::scaling::default_rules(&ScalingConfig::default()) {
            engine.add_rule(rule).await;
        }
        assert!(engine.process().await.is_empty());
    }
}
