mod args_parse;

use std::{fs::read_to_string, net::SocketAddr, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::Parser;
use gantry_controller::{
    control::{local::LocalControl, BrokerProvider},
    controller_metrics::init_metrics,
    local::LocalFleet,
    migration::BrokerConnector,
    service_configuration::{ControlMode, LoadConfiguration, ServiceConfiguration},
    GantryController,
};
use gantry_core::metadata::{MemoryStore, MetadataStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::args_parse::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging, RUST_LOG overrides the default level
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Parse command line arguments
    let args = Args::parse();

    // Load the configuration from the specified YAML file
    let config_content = read_to_string(Path::new(&args.config_file))
        .context(format!("Failed to read config file: {}", args.config_file))?;
    let load_config: LoadConfiguration = serde_yaml::from_str(&config_content)?;

    // Attempt to transform LoadConfiguration into ServiceConfiguration
    let mut service_config: ServiceConfiguration = load_config.try_into()?;

    // If `endpoint_addr` is provided via command-line args, override the value from the config file
    if let Some(endpoint_addr) = args.endpoint_addr {
        let endpoint_address: SocketAddr = endpoint_addr.parse().context(format!(
            "Failed to parse into Socket address: {}",
            endpoint_addr
        ))?;
        service_config.endpoint_addr = endpoint_address;
    }

    // If `prom_exporter` is provided via command-line args, override the value from the config file
    if let Some(prom_exporter) = args.prom_exporter {
        let prom_address: SocketAddr = prom_exporter.parse().context(format!(
            "Failed to parse into Socket address: {}",
            prom_exporter
        ))?;
        service_config.prom_exporter = Some(prom_address);
    }

    if let Some(controller_id) = args.controller_id {
        service_config.controller_id = controller_id;
    }

    // Init metrics with or without prometheus exporter
    init_metrics(service_config.prom_exporter, &service_config.controller_id);

    let (provider, broker_connector): (Arc<dyn BrokerProvider>, Arc<dyn BrokerConnector>) =
        match &service_config.mode {
            ControlMode::Local { initial_brokers } => {
                info!(brokers = initial_brokers, "starting in-process broker fleet");
                let fleet = LocalFleet::with_brokers(*initial_brokers).await;
                (Arc::new(LocalControl::new(fleet.clone())), Arc::new(fleet))
            }
            ControlMode::Kubernetes(k8s) => bail!(
                "kubernetes control of namespace {} needs orchestration and management clients \
                 supplied by the embedding application",
                k8s.namespace
            ),
        };

    // Single process: coordination, when enabled, runs against an in-memory store
    let store: Option<Arc<dyn MetadataStore>> = service_config
        .coordination
        .enabled
        .then(|| Arc::new(MemoryStore::new()) as Arc<dyn MetadataStore>);

    let controller = GantryController::new(service_config, provider, broker_connector, store).await?;
    controller.start().await?;

    info!("gantry controller is running, press ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;

    controller.stop().await;
    Ok(())
}
