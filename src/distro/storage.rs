//! Distro Storage Adapter
//!
//! Produces the payloads the transport moves: targeted batches, whole-store
//! snapshots and the checksum digest of the keys this node owns. Also holds
//! the one-way "initial load done" latch that gates verification.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::codec::DistroCodec;
use super::data::{DataOperation, SyncKey, SyncPayload};
use super::mapper::DistroMapper;
use crate::error::Result;
use crate::store::{DataStore, Datum, ResourceKey};

/// Read side of the datum store for Distro
pub struct DistroDataStorage {
    store: Arc<DataStore>,
    mapper: Arc<DistroMapper>,
    codec: DistroCodec,
    initial_load_done: AtomicBool,
}

impl DistroDataStorage {
    pub fn new(store: Arc<DataStore>, mapper: Arc<DistroMapper>, codec: DistroCodec) -> Self {
        Self {
            store,
            mapper,
            codec,
            initial_load_done: AtomicBool::new(false),
        }
    }

    pub fn codec(&self) -> &DistroCodec {
        &self.codec
    }

    /// Encoded data for a single or combined key. Absent keys are left out.
    pub async fn get_data(&self, key: &SyncKey) -> Result<SyncPayload> {
        let keys = key.resource_keys();
        let datums: BTreeMap<ResourceKey, Datum> = self.store.batch_get(&keys).await;
        let content = self.codec.encode(&datums)?;
        Ok(SyncPayload::new(key.clone(), content, DataOperation::Sync))
    }

    /// Encoded copy of the whole store
    pub async fn get_snapshot(&self) -> Result<SyncPayload> {
        let datums = self.store.snapshot().await;
        let content = self.codec.encode(&datums)?;
        Ok(SyncPayload::new(SyncKey::Snapshot, content, DataOperation::Snapshot))
    }

    /// Checksum digest of the keys this node owns; empty when it owns none
    pub async fn get_verify_data(&self) -> Result<Vec<SyncPayload>> {
        let checksums: BTreeMap<ResourceKey, String> = self
            .store
            .checksums()
            .await
            .into_iter()
            .filter(|(key, _)| self.mapper.is_responsible(key))
            .collect();

        if checksums.is_empty() {
            return Ok(Vec::new());
        }

        tracing::trace!("Verify digest covers {} keys", checksums.len());
        let content = self.codec.encode(&checksums)?;
        Ok(vec![SyncPayload::new(
            SyncKey::Checksum,
            content,
            DataOperation::Verify,
        )])
    }

    /// Set the latch; it never resets
    pub fn mark_initial_load_done(&self) {
        if !self.initial_load_done.swap(true, Ordering::SeqCst) {
            tracing::info!("Distro initial load finished");
        }
    }

    pub fn is_initial_load_done(&self) -> bool {
        self.initial_load_done.load(Ordering::SeqCst)
    }
}
