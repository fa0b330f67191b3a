//! Datum Change Notifier
//!
//! Listeners register per resource key. Mutations enqueue a change or delete
//! task and a single dispatch task calls the listeners with the datum as it
//! is in the store at dispatch time, so a burst of changes to one key is
//! delivered once.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};

use crate::store::{DataStore, Datum, ResourceKey};

/// Kind of change delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Change,
    Delete,
}

/// Receives changes of the keys it listens to
pub trait RecordListener: Send + Sync {
    fn on_change(&self, key: &str, datum: &Datum);

    fn on_delete(&self, key: &str);
}

/// Queues datum changes and dispatches them to listeners
pub struct Notifier {
    listeners: RwLock<HashMap<ResourceKey, Vec<Arc<dyn RecordListener>>>>,
    /// Keys with a change task not yet dispatched
    pending: Mutex<HashSet<ResourceKey>>,
    tasks: mpsc::UnboundedSender<(ResourceKey, ChangeKind)>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<(ResourceKey, ChangeKind)>>>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tasks, queue) = mpsc::unbounded_channel();
        Self {
            listeners: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            tasks,
            queue: Mutex::new(Some(queue)),
        }
    }

    /// Register `listener` for `key`; registering the same listener twice is a no-op
    pub fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let registered = listeners.entry(key.to_string()).or_default();
        if registered.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        registered.push(listener);
    }

    /// Remove `listener` from `key`
    pub fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        if let Some(registered) = listeners.get_mut(key) {
            registered.retain(|l| !Arc::ptr_eq(l, listener));
            if registered.is_empty() {
                listeners.remove(key);
            }
        }
    }

    fn listeners_of(&self, key: &str) -> Vec<Arc<dyn RecordListener>> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(key).cloned().unwrap_or_default()
    }

    fn has_listeners(&self, key: &str) -> bool {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.contains_key(key)
    }

    /// Queue a notification; keys without listeners are skipped
    pub fn add_task(&self, key: &str, kind: ChangeKind) {
        if !self.has_listeners(key) {
            return;
        }
        if kind == ChangeKind::Change {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            if !pending.insert(key.to_string()) {
                return;
            }
        }
        if self.tasks.send((key.to_string(), kind)).is_err() {
            tracing::debug!("Notifier stopped, dropping {:?} of {}", kind, key);
        }
    }

    /// Dispatch queued tasks until `shutdown` fires. Only the first call runs.
    pub async fn run(&self, store: Arc<DataStore>, mut shutdown: watch::Receiver<bool>) {
        let taken = self.queue.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut queue) = taken else {
            tracing::warn!("Notifier already running");
            return;
        };

        loop {
            tokio::select! {
                task = queue.recv() => match task {
                    Some((key, kind)) => self.dispatch(&store, &key, kind).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn dispatch(&self, store: &DataStore, key: &str, kind: ChangeKind) {
        if kind == ChangeKind::Change {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(key);
        }

        let listeners = self.listeners_of(key);
        match kind {
            ChangeKind::Change => {
                let Some(datum) = store.get(key).await else {
                    return;
                };
                for listener in &listeners {
                    listener.on_change(key, &datum);
                }
            }
            ChangeKind::Delete => {
                for listener in &listeners {
                    listener.on_delete(key);
                }
            }
        }
        tracing::debug!(
            "Notified {} listeners of {:?} on {}",
            listeners.len(),
            kind,
            key
        );
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingListener;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listeners_see_current_datum() {
        let store = Arc::new(DataStore::new());
        let notifier = Arc::new(Notifier::new());
        let listener = Arc::new(RecordingListener::default());
        notifier.listen("svc:A", listener.clone());

        let mut datum = Datum::empty_instances("svc:A");
        datum.timestamp = 7;
        store.put(datum).await;

        // Queued twice before dispatch, delivered once
        notifier.add_task("svc:A", ChangeKind::Change);
        notifier.add_task("svc:A", ChangeKind::Change);
        notifier.add_task("svc:B", ChangeKind::Change);

        let (stop, shutdown) = watch::channel(false);
        let running = Arc::clone(&notifier);
        let dispatcher = tokio::spawn(async move { running.run(store, shutdown).await });

        tokio::time::timeout(Duration::from_secs(1), listener.notify.notified())
            .await
            .unwrap();
        notifier.add_task("svc:A", ChangeKind::Delete);
        tokio::time::timeout(Duration::from_secs(1), listener.notify.notified())
            .await
            .unwrap();

        assert_eq!(*listener.changes.lock().unwrap(), vec![("svc:A".to_string(), 7)]);
        assert_eq!(*listener.deletes.lock().unwrap(), vec!["svc:A".to_string()]);

        stop.send(true).unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_unlisten_and_duplicate_listen() {
        let notifier = Notifier::new();
        let listener: Arc<dyn RecordListener> = Arc::new(RecordingListener::default());

        notifier.listen("svc:A", Arc::clone(&listener));
        notifier.listen("svc:A", Arc::clone(&listener));
        assert_eq!(notifier.listeners_of("svc:A").len(), 1);

        notifier.unlisten("svc:A", &listener);
        assert!(!notifier.has_listeners("svc:A"));
    }
}
