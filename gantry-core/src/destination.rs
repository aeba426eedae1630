use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Marker used by brokers for advisory topics; those never take part in scaling decisions.
pub const ADVISORY_MARKER: &str = "advisory";
/// Marker used by brokers for temporary destinations.
pub const TEMP_MARKER: &str = "temp-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// A named queue or topic hosted by a broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub physical_name: String,
}

impl Destination {
    pub fn new(kind: DestinationKind, physical_name: impl Into<String>) -> Self {
        Destination {
            kind,
            physical_name: physical_name.into(),
        }
    }

    pub fn queue(physical_name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Queue, physical_name)
    }

    pub fn topic(physical_name: impl Into<String>) -> Self {
        Self::new(DestinationKind::Topic, physical_name)
    }

    pub fn is_queue(&self) -> bool {
        self.kind == DestinationKind::Queue
    }

    pub fn is_topic(&self) -> bool {
        self.kind == DestinationKind::Topic
    }

    /// Advisory and temporary destinations are broker housekeeping, not client load.
    pub fn is_internal(&self) -> bool {
        let name = self.physical_name.to_ascii_lowercase();
        name.contains(ADVISORY_MARKER) || name.contains(TEMP_MARKER)
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue://{}", self.physical_name),
            DestinationKind::Topic => write!(f, "topic://{}", self.physical_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn destinations_are_structural_map_keys() {
        let mut set = HashSet::new();
        set.insert(Destination::queue("orders"));
        set.insert(Destination::queue("orders"));
        set.insert(Destination::topic("orders"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn internal_destinations_are_detected() {
        assert!(Destination::topic("ActiveMQ.Advisory.Connection").is_internal());
        assert!(Destination::queue("ID:host-temp-queue-1").is_internal());
        assert!(!Destination::queue("payments").is_internal());
    }

    #[test]
    fn display_uses_kind_scheme() {
        assert_eq!(Destination::queue("a").to_string(), "queue://a");
        assert_eq!(Destination::topic("b").to_string(), "topic://b");
    }
}
