use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 13] = [
    RULE_EVALUATIONS_TOTAL,
    RULE_FIRINGS_TOTAL,
    SCALE_UP_REQUESTS_TOTAL,
    SCALE_DOWN_REQUESTS_TOTAL,
    MIGRATIONS_STARTED_TOTAL,
    MIGRATIONS_COMPLETED_TOTAL,
    MIGRATIONS_FAILED_TOTAL,
    MIGRATED_MESSAGES_TOTAL,
    TRANSPORTS_CREATED_TOTAL,
    TRANSPORTS_DESTROYED_TOTAL,
    STUCK_TASKS_CANCELLED_TOTAL,
    EXECUTOR_REJECTIONS_TOTAL,
    BROKER_POLL_FAILURES_TOTAL,
];
pub(crate) const GAUGES: [Metric; 4] = [
    FLEET_BROKERS,
    BROKER_LOAD_PERCENT,
    ASYNC_REQUESTS_PENDING,
    CLIENT_DISTRIBUTIONS,
];
pub(crate) const HISTOGRAMS: [Metric; 2] = [POLL_CYCLE_DURATION_SECONDS, MIGRATION_DURATION_SECONDS];

// SCALING Metrics --------------------------

pub(crate) const RULE_EVALUATIONS_TOTAL: Metric = Metric {
    name: "gantry_rule_evaluations_total",
    description: "Total number of scaling rule evaluations, labeled by rule",
};

pub(crate) const RULE_FIRINGS_TOTAL: Metric = Metric {
    name: "gantry_rule_firings_total",
    description: "Total number of times a scaling rule condition matched, labeled by rule",
};

pub(crate) const SCALE_UP_REQUESTS_TOTAL: Metric = Metric {
    name: "gantry_scale_up_requests_total",
    description: "Replica count increments requested from the orchestrator",
};

pub(crate) const SCALE_DOWN_REQUESTS_TOTAL: Metric = Metric {
    name: "gantry_scale_down_requests_total",
    description: "Replica count decrements requested from the orchestrator",
};

// FLEET Metrics --------------------------

pub(crate) const FLEET_BROKERS: Metric = Metric {
    name: "gantry_fleet_brokers",
    description: "Number of brokers currently in the fleet model",
};

pub(crate) const BROKER_LOAD_PERCENT: Metric = Metric {
    name: "gantry_broker_load_percent",
    description: "Weighted load score of a broker, labeled by broker",
};

pub(crate) const BROKER_POLL_FAILURES_TOTAL: Metric = Metric {
    name: "gantry_broker_poll_failures_total",
    description: "Broker statistics polls that failed and were skipped for the cycle",
};

pub(crate) const POLL_CYCLE_DURATION_SECONDS: Metric = Metric {
    name: "gantry_poll_cycle_duration_seconds",
    description: "Duration of one reconcile cycle (poll, rules, listeners)",
};

// MIGRATION Metrics --------------------------

pub(crate) const MIGRATIONS_STARTED_TOTAL: Metric = Metric {
    name: "gantry_migrations_started_total",
    description: "Destination migrations started between two brokers",
};

pub(crate) const MIGRATIONS_COMPLETED_TOTAL: Metric = Metric {
    name: "gantry_migrations_completed_total",
    description: "Destination migrations that drained and switched ownership",
};

pub(crate) const MIGRATIONS_FAILED_TOTAL: Metric = Metric {
    name: "gantry_migrations_failed_total",
    description: "Destination migrations abandoned on worker error or timeout",
};

pub(crate) const MIGRATED_MESSAGES_TOTAL: Metric = Metric {
    name: "gantry_migrated_messages_total",
    description: "Messages republished from a source broker to a target broker",
};

pub(crate) const MIGRATION_DURATION_SECONDS: Metric = Metric {
    name: "gantry_migration_duration_seconds",
    description: "Wall time of a copy or move of a destination batch",
};

// DISTRIBUTION Metrics --------------------------

pub(crate) const TRANSPORTS_CREATED_TOTAL: Metric = Metric {
    name: "gantry_transports_created_total",
    description: "Broker transports created for client distributions",
};

pub(crate) const TRANSPORTS_DESTROYED_TOTAL: Metric = Metric {
    name: "gantry_transports_destroyed_total",
    description: "Broker transports stopped or lost",
};

pub(crate) const ASYNC_REQUESTS_PENDING: Metric = Metric {
    name: "gantry_async_requests_pending",
    description: "Async requests awaiting broker responses across all distributions",
};

pub(crate) const CLIENT_DISTRIBUTIONS: Metric = Metric {
    name: "gantry_client_distributions",
    description: "Client connections currently multiplexed onto the fleet",
};

// EXECUTOR Metrics --------------------------

pub(crate) const STUCK_TASKS_CANCELLED_TOTAL: Metric = Metric {
    name: "gantry_stuck_tasks_cancelled_total",
    description: "Periodic task runs cancelled for exceeding their runtime budget",
};

pub(crate) const EXECUTOR_REJECTIONS_TOTAL: Metric = Metric {
    name: "gantry_executor_rejections_total",
    description: "Tasks rejected because the executor was saturated",
};

pub fn init_metrics(prom_addr: Option<std::net::SocketAddr>, controller_id: &str) {
    info!("initializing metrics exporter");

    if let Some(addr) = prom_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .add_global_label("controller", controller_id.to_string())
            .install()
            .expect("failed to install Prometheus recorder");
    }

    for name in COUNTERS {
        register_counter(name)
    }

    for name in GAUGES {
        register_gauge(name)
    }

    for name in HISTOGRAMS {
        register_histogram(name)
    }
}

fn register_counter(metric: Metric) {
    metrics::describe_counter!(metric.name, metric.description);
    let _counter = metrics::counter!(metric.name);
}

fn register_gauge(metric: Metric) {
    metrics::describe_gauge!(metric.name, metric.description);
    let _gauge = metrics::gauge!(metric.name);
}

fn register_histogram(metric: Metric) {
    metrics::describe_histogram!(metric.name, metric.description);
    let _histogram = metrics::histogram!(metric.name);
}
