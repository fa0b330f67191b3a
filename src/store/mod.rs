//! Local Datum Store
//!
//! In-memory keyed store of replicated records. Every mutation, whether a
//! local register/deregister or a merge of peer data, goes through
//! [`DataStore::update`] so a key is never observed half-written.

pub mod datum;

pub use datum::{
    now_millis, Datum, DatumValue, Instance, InstanceOperation, Instances, OperationKind,
    ResourceKey,
};

use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Concurrent in-memory datum store
#[derive(Default)]
pub struct DataStore {
    data: RwLock<HashMap<ResourceKey, Datum>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of a datum
    pub async fn get(&self, key: &str) -> Option<Datum> {
        self.data.read().await.get(key).cloned()
    }

    /// Get copies of the named datums, skipping absent keys
    pub async fn batch_get<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a ResourceKey>,
    ) -> BTreeMap<ResourceKey, Datum> {
        let data = self.data.read().await;
        keys.into_iter()
            .filter_map(|key| data.get(key).map(|d| (key.clone(), d.clone())))
            .collect()
    }

    /// Copy of the whole store
    pub async fn snapshot(&self) -> BTreeMap<ResourceKey, Datum> {
        let data = self.data.read().await;
        data.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.data.read().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<ResourceKey> {
        self.data.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// Checksum of every stored datum
    pub async fn checksums(&self) -> BTreeMap<ResourceKey, String> {
        let data = self.data.read().await;
        data.iter().map(|(k, v)| (k.clone(), v.checksum())).collect()
    }

    /// Mutate one datum in place, creating it with `init` when absent.
    /// The write lock is held for the whole closure.
    pub async fn update<F, R>(&self, key: &str, init: impl FnOnce() -> Datum, f: F) -> R
    where
        F: FnOnce(&mut Datum) -> R,
    {
        let mut data = self.data.write().await;
        let datum = data.entry(key.to_string()).or_insert_with(init);
        f(datum)
    }

    /// Mutate one datum in place if it exists
    pub async fn update_existing<F, R>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnOnce(&mut Datum) -> R,
    {
        let mut data = self.data.write().await;
        data.get_mut(key).map(f)
    }

    /// Insert or replace a datum
    pub async fn put(&self, datum: Datum) {
        let mut data = self.data.write().await;
        data.insert(datum.key.clone(), datum);
    }

    /// Remove a datum
    pub async fn remove(&self, key: &str) -> Option<Datum> {
        self.data.write().await.remove(key)
    }
}
