use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::control::kubernetes::KubernetesConfig;
use crate::control::BrokerControlConfig;
use crate::coordination::CoordinationConfig;
use crate::distribution::DistributionConfig;
use crate::migration::MigrationConfig;
use crate::model::{BrokerLimits, LoadPolicy};
use crate::scaling::ScalingConfig;

/// configuration settings loaded from the config file
#[derive(Debug, Serialize, Deserialize)]
pub struct LoadConfiguration {
    /// Controller identity, listener and poll loop
    pub controller: ControllerConfig,
    /// Per-broker and per-destination ceilings
    #[serde(default)]
    pub limits: BrokerLimits,
    /// Scaling rule priorities, thresholds and load weights
    #[serde(default)]
    pub scaling: ScalingConfig,
    /// Client distribution readiness and request correlation
    #[serde(default)]
    pub distribution: DistributionConfig,
    /// Destination drain timeouts
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Multi-controller coordination
    #[serde(default)]
    pub coordination: CoordinationConfig,
    /// Where the brokers run
    #[serde(default)]
    pub control: ControlMode,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub id: String,
    /// Hostname or IP address for the controller listeners
    pub host: String,
    pub ports: ControllerPorts,
    pub poll_interval_ms: u64,
    pub max_concurrent_tasks: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        let control = BrokerControlConfig::default();
        ControllerConfig {
            id: "gantry-0".to_string(),
            host: "0.0.0.0".to_string(),
            ports: ControllerPorts::default(),
            poll_interval_ms: control.poll_interval_ms,
            max_concurrent_tasks: control.max_concurrent_tasks,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerPorts {
    /// Client connections port
    pub client: u16,
    /// Prometheus metrics exporter port (optional)
    pub prometheus: Option<u16>,
}

impl Default for ControllerPorts {
    fn default() -> Self {
        ControllerPorts {
            client: 61616,
            prometheus: None,
        }
    }
}

/// Broker platform, tagged by `mode`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ControlMode {
    /// In-process brokers
    Local { initial_brokers: usize },
    /// Broker pods behind a replication controller
    Kubernetes(KubernetesConfig),
}

impl Default for ControlMode {
    fn default() -> Self {
        ControlMode::Local { initial_brokers: 1 }
    }
}

/// Validated settings the controller runs with.
#[derive(Debug, Clone)]
pub struct ServiceConfiguration {
    pub controller_id: String,
    /// Address of the client listener
    pub endpoint_addr: SocketAddr,
    /// Prometheus exporter address
    pub prom_exporter: Option<SocketAddr>,
    pub control: BrokerControlConfig,
    pub policy: LoadPolicy,
    pub scaling: ScalingConfig,
    pub distribution: DistributionConfig,
    pub migration: MigrationConfig,
    pub coordination: CoordinationConfig,
    pub mode: ControlMode,
}

/// Implementing the TryFrom trait to transform LoadConfiguration into ServiceConfiguration
impl TryFrom<LoadConfiguration> for ServiceConfiguration {
    type Error = anyhow::Error;

    fn try_from(config: LoadConfiguration) -> Result<Self> {
        let endpoint_addr: SocketAddr = format!("{}:{}", config.controller.host, config.controller.ports.client)
            .parse()
            .context("Failed to create endpoint_addr")?;

        let prom_exporter: Option<SocketAddr> = match config.controller.ports.prometheus {
            Some(port) => Some(
                format!("{}:{}", config.controller.host, port)
                    .parse()
                    .context("Failed to create prom_exporter")?,
            ),
            None => None,
        };

        let weights = &config.scaling.weights;
        if weights.connections + weights.destinations != 100 {
            bail!(
                "scaling.weights must sum to 100, got {} + {}",
                weights.connections,
                weights.destinations
            );
        }
        if config.scaling.max_brokers == 0 || config.scaling.min_brokers > config.scaling.max_brokers {
            bail!(
                "invalid broker bounds: min_brokers {} max_brokers {}",
                config.scaling.min_brokers,
                config.scaling.max_brokers
            );
        }
        if config.controller.poll_interval_ms == 0 {
            bail!("controller.poll_interval_ms must be positive");
        }
        if config.distribution.request_cache_size == 0 {
            bail!("distribution.request_cache_size must be positive");
        }
        if let ControlMode::Local { initial_brokers } = config.control {
            if initial_brokers > config.scaling.max_brokers {
                bail!(
                    "control.initial_brokers {} exceeds scaling.max_brokers {}",
                    initial_brokers,
                    config.scaling.max_brokers
                );
            }
        }

        Ok(ServiceConfiguration {
            controller_id: config.controller.id,
            endpoint_addr,
            prom_exporter,
            control: BrokerControlConfig {
                poll_interval_ms: config.controller.poll_interval_ms,
                max_concurrent_tasks: config.controller.max_concurrent_tasks,
            },
            policy: LoadPolicy::new(config.limits, config.scaling.weights.clone()),
            scaling: config.scaling,
            distribution: config.distribution,
            migration: config.migration,
            coordination: config.coordination,
            mode: config.control,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
controller:
  id: gantry-a
  host: 127.0.0.1
  ports:
    client: 6100
    prometheus: 9040
  poll_interval_ms: 2000
limits:
  max_connections_per_broker: 200
  max_destination_depth: 800
scaling:
  scale_down_threshold_percent: 30
  weights:
    connections: 60
    destinations: 40
control:
  mode: kubernetes
  namespace: messaging
  selector: app=amq
  replication_controller: amq
"#;

    #[test]
    fn sample_configuration_loads() {
        let load: LoadConfiguration = serde_yaml::from_str(SAMPLE).unwrap();
        let config = ServiceConfiguration::try_from(load).unwrap();

        assert_eq!(config.controller_id, "gantry-a");
        assert_eq!(config.endpoint_addr, "127.0.0.1:6100".parse::<SocketAddr>().unwrap());
        assert_eq!(config.prom_exporter, Some("127.0.0.1:9040".parse::<SocketAddr>().unwrap()));
        assert_eq!(config.control.poll_interval_ms, 2000);
        assert_eq!(config.control.max_concurrent_tasks, 32);
        assert_eq!(config.policy.limits.max_connections_per_broker, 200);
        assert_eq!(config.policy.limits.max_destination_depth, 800);
        assert_eq!(config.policy.limits.max_destinations_per_broker, 500);
        assert_eq!(config.policy.weights.destinations, 40);
        assert_eq!(config.scaling.scale_down_threshold_percent, 30);
        assert_eq!(config.scaling.scale_up_priority, 1);
        assert_eq!(config.distribution.request_cache_size, 50_000);
        assert!(!config.coordination.enabled);
        match config.mode {
            ControlMode::Kubernetes(k8s) => {
                assert_eq!(k8s.namespace, "messaging");
                assert_eq!(k8s.management_port, 1099);
            }
            other => panic!("unexpected control mode {:?}", other),
        }
    }

    #[test]
    fn minimal_configuration_uses_defaults() {
        let load: LoadConfiguration = serde_yaml::from_str("controller: {}\n").unwrap();
        let config = ServiceConfiguration::try_from(load).unwrap();
        assert_eq!(config.endpoint_addr.port(), 61616);
        assert_eq!(config.mode, ControlMode::Local { initial_brokers: 1 });
        assert_eq!(config.distribution.readiness_timeout_ms, 60_000);
    }

    #[test]
    fn weights_must_sum_to_one_hundred() {
        let yaml = "controller: {}\nscaling:\n  weights:\n    connections: 90\n    destinations: 20\n";
        let load: LoadConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert!(ServiceConfiguration::try_from(load).is_err());
    }
}
