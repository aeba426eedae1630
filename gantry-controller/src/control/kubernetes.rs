//! Brokers running as pods behind a replication controller.
//!
//! The orchestration and management clients are supplied by the embedder; this module
//! only maps pods to brokers and replica counts to scale requests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BrokerPoll, BrokerProvider};
use crate::controller_metrics::BROKER_POLL_FAILURES_TOTAL;
use crate::errors::{GantryError, Result};
use crate::management::{collect_broker_status, ManagementClient};
use crate::transport::Connector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub ip: Option<String>,
    pub running: bool,
    pub terminating: bool,
}

impl Pod {
    fn is_serving(&self) -> bool {
        self.running && !self.terminating && self.ip.is_some()
    }
}

/// The orchestration calls the control needs.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn get_replicas(&self, namespace: &str, controller: &str) -> Result<usize>;

    async fn set_replicas(&self, namespace: &str, controller: &str, replicas: usize) -> Result<()>;

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesConfig {
    pub namespace: String,
    /// Label selector matching the broker pods.
    pub selector: String,
    pub replication_controller: String,
    /// Port of each broker's management endpoint.
    pub management_port: u16,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        KubernetesConfig {
            namespace: "default".to_string(),
            selector: "app=broker".to_string(),
            replication_controller: "broker".to_string(),
            management_port: 1099,
        }
    }
}

pub struct KubernetesControl {
    config: KubernetesConfig,
    orchestrator: Arc<dyn Orchestrator>,
    management: Arc<dyn ManagementClient>,
    connector: Arc<dyn Connector>,
    // broker id -> pod name, from the last successful read of each pod
    pods: Mutex<HashMap<String, String>>,
}

impl KubernetesControl {
    pub fn new(
        config: KubernetesConfig,
        orchestrator: Arc<dyn Orchestrator>,
        management: Arc<dyn ManagementClient>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        KubernetesControl {
            config,
            orchestrator,
            management,
            connector,
            pods: Mutex::new(HashMap::new()),
        }
    }

    fn management_root(&self, ip: &str) -> String {
        format!("{}:{}", ip, self.config.management_port)
    }

    pub async fn pod_of(&self, broker_id: &str) -> Option<String> {
        self.pods.lock().await.get(broker_id).cloned()
    }
}

#[async_trait]
impl BrokerProvider for KubernetesControl {
    async fn poll_brokers(&self) -> Result<BrokerPoll> {
        let pods = self
            .orchestrator
            .list_pods(&self.config.namespace, &self.config.selector)
            .await?;

        let mut poll = BrokerPoll::default();
        let mut known = self.pods.lock().await;
        let mut current = HashMap::new();
        for pod in pods {
            let Some(ip) = pod.ip.as_deref().filter(|_| pod.is_serving()) else {
                debug!(pod = %pod.name, running = pod.running, terminating = pod.terminating, "pod not serving, skipped");
                continue;
            };
            match collect_broker_status(self.management.as_ref(), &self.management_root(ip)).await {
                Ok(status) => {
                    current.insert(status.broker_id.clone(), pod.name.clone());
                    poll.statuses.push(status);
                }
                Err(e) => {
                    metrics::counter!(BROKER_POLL_FAILURES_TOTAL.name).increment(1);
                    warn!(pod = %pod.name, error = %e, "broker statistics unavailable, skipped this cycle");
                    if let Some((broker_id, _)) = known.iter().find(|(_, name)| **name == pod.name) {
                        current.insert(broker_id.clone(), pod.name.clone());
                        poll.unreachable.push(broker_id.clone());
                    }
                }
            }
        }
        *known = current;
        Ok(poll)
    }

    async fn desired_replicas(&self) -> Result<usize> {
        self.orchestrator
            .get_replicas(&self.config.namespace, &self.config.replication_controller)
            .await
    }

    async fn set_desired_replicas(&self, replicas: usize) -> Result<()> {
        self.orchestrator
            .set_replicas(&self.config.namespace, &self.config.replication_controller, replicas)
            .await?;
        info!(
            controller = %self.config.replication_controller,
            replicas,
            "replica count updated"
        );
        Ok(())
    }

    /// Deletes the pod running `broker_id`. The replication controller may already
    /// have removed a different pod after the replica count was lowered; the next
    /// poll evicts whichever broker actually disappeared.
    async fn delete_broker(&self, broker_id: &str) -> Result<()> {
        let pod = self
            .pod_of(broker_id)
            .await
            .ok_or_else(|| GantryError::Collaborator(format!("no pod known for broker {}", broker_id)))?;
        self.orchestrator.delete_pod(&self.config.namespace, &pod).await?;
        self.pods.lock().await.remove(broker_id);
        info!(broker_id = %broker_id, pod = %pod, "broker pod deleted");
        Ok(())
    }

    fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }
}
