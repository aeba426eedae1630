use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;

use crate::destination::{Destination, DestinationKind};

/// Point-in-time counters for one destination on one broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationOverview {
    pub destination: Destination,
    pub queue_depth: i64,
    pub number_of_producers: u64,
    pub number_of_consumers: u64,
    /// Depth delta observed by the last `set_queue_depth` call.
    pub queue_depth_rate: i64,
}

impl DestinationOverview {
    pub fn new(destination: Destination) -> Self {
        DestinationOverview {
            destination,
            queue_depth: 0,
            number_of_producers: 0,
            number_of_consumers: 0,
            queue_depth_rate: 0,
        }
    }

    pub fn with_counters(
        destination: Destination,
        queue_depth: i64,
        number_of_producers: u64,
        number_of_consumers: u64,
    ) -> Self {
        DestinationOverview {
            destination,
            queue_depth,
            number_of_producers,
            number_of_consumers,
            queue_depth_rate: 0,
        }
    }

    /// Installs a new depth and derives the rate as `new - old`.
    pub fn set_queue_depth(&mut self, queue_depth: i64) {
        self.queue_depth_rate = queue_depth - self.queue_depth;
        self.queue_depth = queue_depth;
    }

    pub fn is_active(&self) -> bool {
        self.queue_depth > 0
    }

    /// `Less` means `self` is more loaded and sorts first: deeper queue, then more
    /// producers, then more consumers. Equal counters fall back to the destination
    /// name so the order is total.
    pub fn cmp_load(&self, other: &Self) -> Ordering {
        other
            .queue_depth
            .cmp(&self.queue_depth)
            .then_with(|| other.number_of_producers.cmp(&self.number_of_producers))
            .then_with(|| other.number_of_consumers.cmp(&self.number_of_consumers))
            .then_with(|| self.destination.cmp(&other.destination))
    }
}

/// Statistics snapshot for one broker, replaced wholesale on every poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerOverview {
    pub broker_id: String,
    pub broker_name: String,
    pub total_connections: u64,
    pub blocked_producers: bool,
    pub queue_overviews: HashMap<Destination, DestinationOverview>,
    pub topic_overviews: HashMap<Destination, DestinationOverview>,
}

impl BrokerOverview {
    pub fn new(broker_id: impl Into<String>, broker_name: impl Into<String>) -> Self {
        BrokerOverview {
            broker_id: broker_id.into(),
            broker_name: broker_name.into(),
            ..Default::default()
        }
    }

    /// Inserts or replaces the overview of a destination, filed by its kind.
    pub fn add_destination(&mut self, overview: DestinationOverview) {
        let map = match overview.destination.kind {
            DestinationKind::Queue => &mut self.queue_overviews,
            DestinationKind::Topic => &mut self.topic_overviews,
        };
        map.insert(overview.destination.clone(), overview);
    }

    pub fn get(&self, destination: &Destination) -> Option<&DestinationOverview> {
        match destination.kind {
            DestinationKind::Queue => self.queue_overviews.get(destination),
            DestinationKind::Topic => self.topic_overviews.get(destination),
        }
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        self.get(destination).is_some()
    }

    pub fn destinations(&self) -> impl Iterator<Item = &DestinationOverview> {
        self.queue_overviews
            .values()
            .chain(self.topic_overviews.values())
    }

    pub fn total_destinations(&self) -> usize {
        self.queue_overviews.len() + self.topic_overviews.len()
    }

    pub fn total_active_destinations(&self) -> usize {
        self.destinations().filter(|d| d.is_active()).count()
    }

    pub fn total_queue_depth(&self) -> i64 {
        self.destinations().map(|d| d.queue_depth).sum()
    }

    pub fn total_consumer_count(&self) -> u64 {
        self.destinations().map(|d| d.number_of_consumers).sum()
    }

    pub fn total_producer_count(&self) -> u64 {
        self.destinations().map(|d| d.number_of_producers).sum()
    }

    /// Destinations ordered most loaded first.
    pub fn sorted_destinations(&self) -> Vec<&DestinationOverview> {
        let mut all: Vec<_> = self.destinations().collect();
        all.sort_by(|a, b| a.cmp_load(b));
        all
    }

    /// `Less` means `self` is the more loaded broker: larger total depth, then more
    /// producers, then more consumers, then more queues. The broker id breaks the
    /// remaining ties so that the order is deterministic for a given snapshot.
    pub fn cmp_load(&self, other: &Self) -> Ordering {
        other
            .total_queue_depth()
            .cmp(&self.total_queue_depth())
            .then_with(|| other.total_producer_count().cmp(&self.total_producer_count()))
            .then_with(|| other.total_consumer_count().cmp(&self.total_consumer_count()))
            .then_with(|| other.queue_overviews.len().cmp(&self.queue_overviews.len()))
            .then_with(|| self.broker_id.cmp(&other.broker_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(id: &str, destinations: &[(&str, i64, u64, u64)]) -> BrokerOverview {
        let mut overview = BrokerOverview::new(id, id);
        for (name, depth, producers, consumers) in destinations {
            overview.add_destination(DestinationOverview::with_counters(
                Destination::queue(*name),
                *depth,
                *producers,
                *consumers,
            ));
        }
        overview
    }

    #[test]
    fn depth_rate_is_delta_since_last_update() {
        let mut overview = DestinationOverview::new(Destination::queue("q"));
        overview.set_queue_depth(10);
        assert_eq!(overview.queue_depth_rate, 10);
        overview.set_queue_depth(4);
        assert_eq!(overview.queue_depth, 4);
        assert_eq!(overview.queue_depth_rate, -6);
    }

    #[test]
    fn destination_ordering_breaks_ties_on_producers_then_consumers() {
        let deep = DestinationOverview::with_counters(Destination::queue("a"), 50, 0, 0);
        let shallow = DestinationOverview::with_counters(Destination::queue("b"), 10, 9, 9);
        assert_eq!(deep.cmp_load(&shallow), Ordering::Less);

        let more_producers = DestinationOverview::with_counters(Destination::queue("c"), 10, 3, 0);
        let fewer_producers = DestinationOverview::with_counters(Destination::queue("d"), 10, 2, 7);
        assert_eq!(more_producers.cmp_load(&fewer_producers), Ordering::Less);

        let more_consumers = DestinationOverview::with_counters(Destination::queue("e"), 10, 2, 5);
        let fewer_consumers = DestinationOverview::with_counters(Destination::queue("f"), 10, 2, 4);
        assert_eq!(more_consumers.cmp_load(&fewer_consumers), Ordering::Less);
    }

    #[test]
    fn deeper_broker_sorts_first() {
        let a = broker("a", &[("q1", 100, 0, 0)]);
        let b = broker("b", &[("q1", 10, 5, 5), ("q2", 10, 5, 5)]);
        assert_eq!(a.cmp_load(&b), Ordering::Less);
        assert_eq!(b.cmp_load(&a), Ordering::Greater);
    }

    #[test]
    fn equal_depth_falls_through_to_producers_and_consumers() {
        let a = broker("a", &[("q1", 10, 3, 0)]);
        let b = broker("b", &[("q1", 10, 1, 9)]);
        assert_eq!(a.cmp_load(&b), Ordering::Less);

        let c = broker("c", &[("q1", 10, 1, 2)]);
        let d = broker("d", &[("q1", 10, 1, 1)]);
        assert_eq!(c.cmp_load(&d), Ordering::Less);

        // identical counters are still totally ordered
        let e = broker("e", &[("q1", 10, 1, 1)]);
        assert_eq!(d.cmp_load(&e), Ordering::Less);
    }

    #[test]
    fn derived_totals() {
        let mut overview = broker("a", &[("q1", 5, 1, 2), ("q2", 0, 3, 0)]);
        overview.add_destination(DestinationOverview::with_counters(
            Destination::topic("t1"),
            2,
            1,
            1,
        ));
        assert_eq!(overview.total_destinations(), 3);
        assert_eq!(overview.total_active_destinations(), 2);
        assert_eq!(overview.total_queue_depth(), 7);
        assert_eq!(overview.total_producer_count(), 5);
        assert_eq!(overview.total_consumer_count(), 3);
        assert!(overview.contains(&Destination::topic("t1")));
        assert!(!overview.contains(&Destination::queue("t1")));
    }

    #[test]
    fn sorted_destinations_most_loaded_first() {
        let overview = broker("a", &[("q1", 5, 0, 0), ("q2", 50, 0, 0), ("q3", 20, 0, 0)]);
        let names: Vec<_> = overview
            .sorted_destinations()
            .iter()
            .map(|d| d.destination.physical_name.clone())
            .collect();
        assert_eq!(names, vec!["q2", "q3", "q1"]);
    }
}
