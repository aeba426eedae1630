use gantry_core::metadata::{MemoryStore, MetadataStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::control::{BrokerControl, BrokerModelChangedListener, BrokerProvider};
use crate::coordination::{BrokerChangeListener, BrokerRegistry, ClusterCoordinator};
use crate::endpoint::MqEndpoint;
use crate::errors::Result;
use crate::interceptor::MessageInterceptorRegistry;
use crate::migration::BrokerConnector;
use crate::model::Model;
use crate::scheduler::TaskExecutor;
use crate::service_configuration::ServiceConfiguration;

// GantryController owns the running control plane:
//
// Fleet model: brokers, their load and destination ownership, fed by the broker control poll.
// Scaling: the rule engine evaluated every poll, acting through the broker provider.
// Client endpoint: accepts clients and fans each one out over every broker.
// Coordination: optional scaling lock and shared broker registry for several controllers.
pub struct GantryController {
    config: ServiceConfiguration,
    control: Arc<BrokerControl>,
    endpoint: Arc<MqEndpoint>,
    interceptors: Arc<MessageInterceptorRegistry>,
    registry: Option<Arc<BrokerRegistry>>,
}

impl GantryController {
    /// Wires the controller. `store` backs coordination when it is enabled; without
    /// one an in-process store is used, which only coordinates this controller.
    pub async fn new(
        config: ServiceConfiguration,
        provider: Arc<dyn BrokerProvider>,
        broker_connector: Arc<dyn BrokerConnector>,
        store: Option<Arc<dyn MetadataStore>>,
    ) -> Result<Self> {
        let executor = Arc::new(TaskExecutor::new(
            config.controller_id.clone(),
            config.control.max_concurrent_tasks,
        ));
        let model = Arc::new(Model::new(
            config.policy.clone(),
            config.migration.clone(),
            broker_connector,
            executor.clone(),
        ));

        let coordinator = if config.coordination.enabled {
            let store = store.unwrap_or_else(|| {
                warn!("coordination enabled without a shared store, locks are local to this controller");
                Arc::new(MemoryStore::new()) as Arc<dyn MetadataStore>
            });
            Some(Arc::new(ClusterCoordinator::new(
                store,
                config.controller_id.clone(),
                config.coordination.clone(),
            )))
        } else {
            None
        };

        let control = BrokerControl::new(
            config.control.clone(),
            config.scaling.clone(),
            provider,
            model,
            executor,
            coordinator.clone(),
        )
        .await;

        let registry = coordinator.map(|coordinator| Arc::new(BrokerRegistry::new(coordinator)));

        let interceptors = Arc::new(MessageInterceptorRegistry::new());
        let endpoint = MqEndpoint::bind(
            &config.endpoint_addr.to_string(),
            control.clone(),
            interceptors.clone(),
            config.distribution.clone(),
        )
        .await?;

        Ok(GantryController {
            config,
            control,
            endpoint,
            interceptors,
            registry,
        })
    }

    pub fn control(&self) -> &Arc<BrokerControl> {
        &self.control
    }

    /// Interceptors applied to every client command before it is distributed.
    pub fn interceptors(&self) -> &Arc<MessageInterceptorRegistry> {
        &self.interceptors
    }

    /// Address the client endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub async fn start(&self) -> Result<()> {
        info!(
            controller_id = %self.config.controller_id,
            endpoint = %self.endpoint.local_addr(),
            "starting gantry controller"
        );

        if let Some(registry) = &self.registry {
            registry.start().await?;
            let changes: Arc<dyn BrokerChangeListener> = self.control.clone();
            registry.add_listener(changes).await;
            let publisher: Arc<dyn BrokerModelChangedListener> = registry.clone();
            self.control.add_model_listener(publisher).await;
        }

        self.control.start().await;
        self.endpoint.start().await;
        info!(controller_id = %self.config.controller_id, "gantry controller started");
        Ok(())
    }

    /// Stops accepting clients, then the control, then coordination.
    pub async fn stop(&self) {
        self.endpoint.stop().await;
        self.control.stop().await;
        if let Some(registry) = &self.registry {
            registry.stop().await;
        }
        self.interceptors.clear().await;
        info!(controller_id = %self.config.controller_id, "gantry controller stopped");
    }
}
