use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "gantry-controller",
    about = "Elastic control plane for a fleet of message brokers",
    version
)]
pub(crate) struct Args {
    /// Path to config file
    #[arg(long)]
    pub(crate) config_file: String,

    /// Client endpoint address, overrides controller.host and controller.ports.client
    #[arg(long)]
    pub(crate) endpoint_addr: Option<String>,

    /// Prometheus Exporter http address
    #[arg(long)]
    pub(crate) prom_exporter: Option<String>,

    /// Controller identity used for locks and the controller registry
    #[arg(long)]
    pub(crate) controller_id: Option<String>,
}
