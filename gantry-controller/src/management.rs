//! Broker statistics read through a broker's management interface.

use async_trait::async_trait;
use gantry_core::{BrokerOverview, Destination, DestinationKind, DestinationOverview};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{GantryError, Result};

pub const BROKER_NAME: &str = "BrokerName";
pub const BROKER_ID: &str = "BrokerId";
pub const OPENWIRE_URL: &str = "OpenWireURL";
pub const TOTAL_CONNECTIONS: &str = "TotalConnectionsCount";
pub const PRODUCER_COUNT: &str = "ProducerCount";
pub const CONSUMER_COUNT: &str = "ConsumerCount";
pub const QUEUE_SIZE: &str = "QueueSize";

const DESTINATION_TYPE: &str = ",destinationType=";
const DESTINATION_NAME: &str = ",destinationName=";

/// Attribute access to one broker's management tree. Objects are addressed by name;
/// destination objects live under the broker's root as
/// `{root},destinationType={Queue|Topic},destinationName={name}`.
#[async_trait]
pub trait ManagementClient: Send + Sync {
    async fn read_attribute(&self, object_name: &str, attribute: &str) -> Result<Value>;

    /// Object names matching `pattern`. A trailing `*` matches any suffix.
    async fn search_objects(&self, pattern: &str) -> Result<Vec<String>>;
}

/// What one poll learns about a broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStatus {
    pub broker_id: String,
    pub broker_name: String,
    pub uri: String,
    pub overview: BrokerOverview,
}

fn type_name(kind: DestinationKind) -> &'static str {
    match kind {
        DestinationKind::Queue => "Queue",
        DestinationKind::Topic => "Topic",
    }
}

pub fn destination_pattern(root: &str, kind: DestinationKind) -> String {
    format!("{}{}{},*", root, DESTINATION_TYPE, type_name(kind))
}

pub fn destination_object_name(root: &str, destination: &Destination) -> String {
    format!(
        "{}{}{}{}{}",
        root,
        DESTINATION_TYPE,
        type_name(destination.kind),
        DESTINATION_NAME,
        destination.physical_name
    )
}

/// Splits a destination object name into its broker root and destination.
pub fn parse_destination(object_name: &str) -> Option<(&str, Destination)> {
    let type_at = object_name.find(DESTINATION_TYPE)?;
    let root = &object_name[..type_at];
    let rest = &object_name[type_at + DESTINATION_TYPE.len()..];
    let name_at = rest.find(DESTINATION_NAME)?;
    let kind = match &rest[..name_at] {
        "Queue" => DestinationKind::Queue,
        "Topic" => DestinationKind::Topic,
        _ => return None,
    };
    let name = &rest[name_at + DESTINATION_NAME.len()..];
    if name.is_empty() {
        return None;
    }
    Some((root, Destination::new(kind, name)))
}

pub fn matches_pattern(pattern: &str, object_name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => object_name.starts_with(prefix),
        None => pattern == object_name,
    }
}

fn as_string(value: Value, attribute: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(GantryError::Collaborator(format!(
            "attribute {} is not a string: {}",
            attribute, other
        ))),
    }
}

fn as_u64(value: &Value, attribute: &str) -> Result<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .ok_or_else(|| GantryError::Collaborator(format!("attribute {} is not a count: {}", attribute, value)))
}

async fn read_destination(
    client: &dyn ManagementClient,
    object_name: &str,
    destination: Destination,
) -> Result<DestinationOverview> {
    let producers = as_u64(&client.read_attribute(object_name, PRODUCER_COUNT).await?, PRODUCER_COUNT)?;
    let consumers = as_u64(&client.read_attribute(object_name, CONSUMER_COUNT).await?, CONSUMER_COUNT)?;
    let depth = as_u64(&client.read_attribute(object_name, QUEUE_SIZE).await?, QUEUE_SIZE)?;
    Ok(DestinationOverview::with_counters(
        destination,
        i64::try_from(depth).unwrap_or(i64::MAX),
        producers,
        consumers,
    ))
}

/// Reads identity, URL, connection count and per-destination counters of the broker
/// rooted at `root`. Advisory and temporary destinations are skipped. A destination
/// that vanishes mid-read is skipped too; any broker-level failure fails the poll.
pub async fn collect_broker_status(client: &dyn ManagementClient, root: &str) -> Result<BrokerStatus> {
    let broker_name = as_string(client.read_attribute(root, BROKER_NAME).await?, BROKER_NAME)?;
    let broker_id = as_string(client.read_attribute(root, BROKER_ID).await?, BROKER_ID)?;
    let uri = as_string(client.read_attribute(root, OPENWIRE_URL).await?, OPENWIRE_URL)?;
    let connections = as_u64(&client.read_attribute(root, TOTAL_CONNECTIONS).await?, TOTAL_CONNECTIONS)?;

    let mut overview = BrokerOverview::new(broker_id.clone(), broker_name.clone());
    overview.total_connections = connections;

    for kind in [DestinationKind::Queue, DestinationKind::Topic] {
        for object_name in client.search_objects(&destination_pattern(root, kind)).await? {
            let Some((_, destination)) = parse_destination(&object_name) else {
                debug!(object = %object_name, "unrecognised management object skipped");
                continue;
            };
            if destination.is_internal() {
                continue;
            }
            match read_destination(client, &object_name, destination).await {
                Ok(destination_overview) => overview.add_destination(destination_overview),
                Err(e) => {
                    warn!(broker_id = %broker_id, object = %object_name, error = %e, "destination statistics unavailable");
                }
            }
        }
    }

    Ok(BrokerStatus {
        broker_id,
        broker_name,
        uri,
        overview,
    })
}
