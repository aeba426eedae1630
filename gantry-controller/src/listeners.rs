use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

pub type ListenerId = u64;

/// Registration list for callback listeners.
///
/// Fan-out always iterates over a copy taken when it starts. A listener added during
/// a fan-out only sees the next one. A removed listener is left out of every fan-out
/// that starts after `remove` returns, though one already running may still call it.
pub struct ListenerList<T: ?Sized> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, Arc<T>)>>,
}

impl<T: ?Sized> Default for ListenerList<T> {
    fn default() -> Self {
        ListenerList {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ListenerList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, listener: Arc<T>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries.write().await.push((id, listener));
        id
    }

    pub async fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub async fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
