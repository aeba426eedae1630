use std::collections::{HashMap, VecDeque};

/// Bounded map of in-flight requests keyed by request id, evicting the least
/// recently used entry when full.
///
/// Recency is tracked with a queue of `(id, stamp)` pairs. A touched entry gets a
/// fresh stamp and a new queue slot; stale slots are skipped on eviction and
/// compacted once they outnumber live entries.
#[derive(Debug)]
pub struct RequestMap<V> {
    capacity: usize,
    entries: HashMap<u32, (V, u64)>,
    order: VecDeque<(u32, u64)>,
    next_stamp: u64,
}

impl<V> RequestMap<V> {
    pub fn new(capacity: usize) -> Self {
        RequestMap {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            next_stamp: 0,
        }
    }

    fn stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    /// Inserts a request, returning the entry evicted to make room, if any.
    pub fn insert(&mut self, id: u32, value: V) -> Option<(u32, V)> {
        let stamp = self.stamp();
        let replaced = self.entries.insert(id, (value, stamp)).is_some();
        self.order.push_back((id, stamp));

        let evicted = if !replaced && self.entries.len() > self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        self.compact();
        evicted
    }

    /// Mutable access that also marks the entry as recently used.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut V> {
        if !self.entries.contains_key(&id) {
            return None;
        }
        let stamp = self.stamp();
        self.order.push_back((id, stamp));
        self.compact();
        self.entries.get_mut(&id).map(|entry| {
            entry.1 = stamp;
            &mut entry.0
        })
    }

    pub fn remove(&mut self, id: u32) -> Option<V> {
        self.entries.remove(&id).map(|(value, _)| value)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.entries.contains_key(&id)
    }

    /// Removes and returns every pending request.
    pub fn drain(&mut self) -> Vec<(u32, V)> {
        self.order.clear();
        self.entries.drain().map(|(id, (value, _))| (id, value)).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) -> Option<(u32, V)> {
        while let Some((id, stamp)) = self.order.pop_front() {
            let live = matches!(self.entries.get(&id), Some((_, current)) if *current == stamp);
            if live {
                return self.entries.remove(&id).map(|(value, _)| (id, value));
            }
        }
        None
    }

    fn compact(&mut self) {
        if self.order.len() > self.capacity.saturating_mul(2) {
            let entries = &self.entries;
            self.order
                .retain(|(id, stamp)| matches!(entries.get(id), Some((_, current)) if current == stamp));
        }
    }
}
