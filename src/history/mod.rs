//! In-memory conversation history with change notifications.
//!
//! Observers receive content-added, compaction-started and compaction-ended
//! signals synchronously, on the thread that mutates the history. Compaction
//! re-populates the store in place, so the summary item is announced as added
//! content inside the compaction bracket.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::types::Content;

/// Receiver of history change signals.
pub trait HistoryObserver: Send + Sync {
    fn on_content_added(&self, content: &Content);

    fn on_compaction_started(&self) {}

    fn on_compaction_ended(&self, summary: &Content, items_compressed: usize);

    /// The last `count` items were dropped (undo/rewind).
    fn on_items_removed(&self, _count: usize) {}
}

type ObserverList = Mutex<Vec<(u64, Weak<dyn HistoryObserver>)>>;

#[derive(Default)]
struct Observers {
    next_id: AtomicU64,
    list: ObserverList,
}

impl Observers {
    fn add(&self, observer: Weak<dyn HistoryObserver>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));
        id
    }

    fn remove(&self, id: u64) {
        self.list
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(i, _)| *i != id);
    }

    /// Live observers; dead weak references are pruned.
    fn snapshot(&self) -> Vec<Arc<dyn HistoryObserver>> {
        let mut list = self.list.lock().unwrap_or_else(PoisonError::into_inner);
        list.retain(|(_, weak)| weak.strong_count() > 0);
        list.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    fn len(&self) -> usize {
        self.snapshot().len()
    }
}

/// Keeps an observer registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the observer"]
pub struct Subscription {
    id: u64,
    observers: Weak<Observers>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Default)]
pub struct HistoryService {
    items: Vec<Content>,
    observers: Arc<Observers>,
}

impl HistoryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a history from previously recorded items without notifying anyone.
    ///
    /// Empty items are dropped.
    pub fn from_items(items: Vec<Content>) -> Self {
        Self {
            items: items.into_iter().filter(|c| !c.is_empty()).collect(),
            observers: Arc::default(),
        }
    }

    /// Register an observer. It stays registered while the returned
    /// [`Subscription`] and the observer itself are alive.
    pub fn subscribe(&self, observer: &Arc<dyn HistoryObserver>) -> Subscription {
        let id = self.observers.add(Arc::downgrade(observer));
        Subscription {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn add(&mut self, content: Content) {
        if content.is_empty() {
            return;
        }
        for observer in self.observers.snapshot() {
            observer.on_content_added(&content);
        }
        self.items.push(content);
    }

    /// Replace every item with `summary`. Returns the number of items replaced.
    ///
    /// An empty summary leaves the history empty; observers still see the
    /// compaction.
    pub fn compress(&mut self, summary: Content) -> usize {
        let observers = self.observers.snapshot();
        let items_compressed = self.items.len();

        for observer in &observers {
            observer.on_compaction_started();
        }

        self.items.clear();
        self.add(summary.clone());

        for observer in &observers {
            observer.on_compaction_ended(&summary, items_compressed);
        }

        tracing::debug!(items_compressed, "History compacted");
        items_compressed
    }

    /// Drop the last `count` items, clamped at empty. Returns how many were removed.
    pub fn rewind(&mut self, count: usize) -> usize {
        let removed = count.min(self.items.len());
        if removed == 0 {
            return 0;
        }
        self.items.truncate(self.items.len() - removed);
        for observer in self.observers.snapshot() {
            observer.on_items_removed(removed);
        }
        removed
    }

    pub fn items(&self) -> &[Content] {
        &self.items
    }

    pub fn into_items(self) -> Vec<Content> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl std::fmt::Debug for HistoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryService")
            .field("items", &self.items.len())
            .field("observers", &self.observers.len())
            .finish()
    }
}
