//! Distro Protocol
//!
//! Drives replication for one node:
//!
//! - Local writes are applied through the store and pushed to every peer as
//!   add/remove operations.
//! - Incoming state pushes merge with the grow-only resolver, incoming
//!   operations with the add-wins resolver.
//! - Verify rounds send the checksum digest of owned keys to every peer. A
//!   receiver acknowledges the digest, then on its own task pulls what
//!   differs from the owner and drops what the owner no longer has.
//! - A cold start pulls a snapshot before verification is enabled.
//! - A membership change re-derives ownership and adopts newly owned keys.
//! - Every change to the store is queued for registered record listeners.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;

use super::codec::DistroCodec;
use super::data::{DataOperation, SyncKey, SyncPayload};
use super::mapper::DistroMapper;
use super::notifier::{ChangeKind, Notifier, RecordListener};
use super::resolver::{AddWinsResolver, GrowOnlyResolver};
use super::storage::DistroDataStorage;
use super::transport::{DistroCallback, DistroTransportAgent};
use crate::cluster::{ClusterConnectionManager, MemberSource};
use crate::config::DistroConfig;
use crate::error::{Error, Result};
use crate::network::{ErrorCode, Message, RequestHandler};
use crate::store::{
    now_millis, DataStore, Datum, Instance, InstanceOperation, OperationKind, ResourceKey,
};

/// Timing and resolver settings
#[derive(Debug, Clone)]
pub struct DistroOptions {
    pub verify_interval: Duration,
    pub load_retry_delay: Duration,
    pub max_time_difference: u64,
}

impl Default for DistroOptions {
    fn default() -> Self {
        Self {
            verify_interval: Duration::from_secs(5),
            load_retry_delay: Duration::from_secs(30),
            max_time_difference: 5000,
        }
    }
}

impl From<&DistroConfig> for DistroOptions {
    fn from(config: &DistroConfig) -> Self {
        Self {
            verify_interval: config.verify_interval(),
            load_retry_delay: config.load_retry_delay(),
            max_time_difference: config.max_time_difference_ms,
        }
    }
}

/// Logs the outcome of a non-blocking push
struct LoggingCallback {
    key: SyncKey,
    target: String,
}

impl DistroCallback for LoggingCallback {
    fn on_success(&self) {
        tracing::trace!("Distro push of {} to {} succeeded", self.key, self.target);
    }

    fn on_failed(&self, error: Option<Error>) {
        match error {
            Some(e) => tracing::warn!("Distro push of {} to {} failed: {}", self.key, self.target, e),
            None => tracing::warn!("Distro push of {} to {} rejected", self.key, self.target),
        }
    }
}

/// Marks a verify round from one source as in flight until dropped
struct VerifyRound<'a> {
    rounds: &'a Mutex<HashSet<String>>,
    source: String,
}

impl<'a> VerifyRound<'a> {
    fn begin(rounds: &'a Mutex<HashSet<String>>, source: &str) -> Option<Self> {
        let mut active = rounds.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(source.to_string()) {
            return None;
        }
        Some(Self {
            rounds,
            source: source.to_string(),
        })
    }
}

impl Drop for VerifyRound<'_> {
    fn drop(&mut self) {
        let mut active = self.rounds.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.source);
    }
}

/// Applies checksum digests received from key owners
struct Verifier {
    store: Arc<DataStore>,
    mapper: Arc<DistroMapper>,
    transport: Arc<dyn DistroTransportAgent>,
    codec: DistroCodec,
    notifier: Arc<Notifier>,
    rounds: Mutex<HashSet<String>>,
}

impl Verifier {
    /// Compare `source`'s digest with the local store and repair.
    ///
    /// Returns `false` when the round was skipped: another round from the
    /// same source is running, or the digest names a key this node owns.
    async fn verify(&self, checksums: BTreeMap<ResourceKey, String>, source: &str) -> Result<bool> {
        let _round = match VerifyRound::begin(&self.rounds, source) {
            Some(round) => round,
            None => {
                tracing::warn!("Verify round from {} already running, dropping digest", source);
                return Ok(false);
            }
        };

        let mut to_update = Vec::new();
        for (key, checksum) in &checksums {
            if self.mapper.is_responsible(key) {
                tracing::error!("Received checksum of owned key {} from {}, aborting", key, source);
                return Ok(false);
            }
            match self.store.get(key).await {
                Some(datum) if &datum.checksum() == checksum => {}
                _ => to_update.push(key.clone()),
            }
        }

        let to_remove: Vec<ResourceKey> = self
            .store
            .keys()
            .await
            .into_iter()
            .filter(|key| self.mapper.map_server(key).as_deref() == Some(source))
            .filter(|key| !checksums.contains_key(key))
            .collect();

        for key in &to_remove {
            tracing::info!("Removing {} no longer held by owner {}", key, source);
            if self.store.remove(key).await.is_some() {
                self.notifier.add_task(key, ChangeKind::Delete);
            }
        }

        if !to_update.is_empty() {
            tracing::debug!("Pulling {} keys from {}", to_update.len(), source);
            let key = SyncKey::Combined {
                keys: to_update,
                target: source.to_string(),
            };
            let payload = self.transport.get_data(&key, source).await?;
            let datums: BTreeMap<ResourceKey, Datum> = self.codec.decode(&payload.content)?;
            for (_, datum) in datums {
                self.replace(datum).await;
            }
        }

        Ok(true)
    }

    /// Take the owner's value; the timestamp never moves backwards
    async fn replace(&self, incoming: Datum) {
        let key = incoming.key.clone();
        self.store
            .update(
                &key,
                || incoming.clone(),
                |current| {
                    current.value = incoming.value.clone();
                    current.advance_timestamp(incoming.timestamp);
                },
            )
            .await;
        self.notifier.add_task(&key, ChangeKind::Change);
    }
}

/// Replication driver of one node
pub struct DistroProtocol {
    members: Arc<dyn MemberSource>,
    store: Arc<DataStore>,
    mapper: Arc<DistroMapper>,
    storage: DistroDataStorage,
    transport: Arc<dyn DistroTransportAgent>,
    connections: Option<Arc<ClusterConnectionManager>>,
    codec: DistroCodec,
    add_wins: AddWinsResolver,
    grow_only: GrowOnlyResolver,
    options: DistroOptions,
    notifier: Arc<Notifier>,
    verifier: Arc<Verifier>,
    shutdown: watch::Sender<bool>,
}

impl DistroProtocol {
    pub fn new(
        members: Arc<dyn MemberSource>,
        store: Arc<DataStore>,
        mapper: Arc<DistroMapper>,
        transport: Arc<dyn DistroTransportAgent>,
        codec: DistroCodec,
        options: DistroOptions,
    ) -> Self {
        let storage = DistroDataStorage::new(Arc::clone(&store), Arc::clone(&mapper), codec);
        let notifier = Arc::new(Notifier::new());
        let verifier = Arc::new(Verifier {
            store: Arc::clone(&store),
            mapper: Arc::clone(&mapper),
            transport: Arc::clone(&transport),
            codec,
            notifier: Arc::clone(&notifier),
            rounds: Mutex::new(HashSet::new()),
        });
        let (shutdown, _) = watch::channel(false);

        Self {
            members,
            store,
            mapper,
            storage,
            transport,
            connections: None,
            codec,
            add_wins: AddWinsResolver::new(options.max_time_difference),
            grow_only: GrowOnlyResolver::new(options.max_time_difference),
            options,
            notifier,
            verifier,
            shutdown,
        }
    }

    /// Reconcile `connections` with membership changes
    pub fn with_connections(mut self, connections: Arc<ClusterConnectionManager>) -> Self {
        self.connections = Some(connections);
        self
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn mapper(&self) -> &Arc<DistroMapper> {
        &self.mapper
    }

    pub fn storage(&self) -> &DistroDataStorage {
        &self.storage
    }

    pub fn local_address(&self) -> &str {
        self.members.local_address()
    }

    /// Notify `listener` of changes to `key`
    pub fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) {
        self.notifier.listen(key, listener);
    }

    pub fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) {
        self.notifier.unlisten(key, listener);
    }

    // ========== Local writes ==========

    /// Register an instance locally and push the addition to every peer
    pub async fn register_instance(&self, key: &str, instance: Instance) -> Result<()> {
        let operation = InstanceOperation::add(vec![instance], 0);
        match self.apply_local(key, operation, true).await? {
            Some(operation) => self.distribute(key, operation, DataOperation::Add).await,
            None => Ok(()),
        }
    }

    /// Deregister an instance locally and push the removal to every peer.
    /// An unknown key is left absent.
    pub async fn deregister_instance(&self, key: &str, instance: Instance) -> Result<()> {
        let operation = InstanceOperation::remove(vec![instance], 0);
        match self.apply_local(key, operation, false).await? {
            Some(operation) => self.distribute(key, operation, DataOperation::Remove).await,
            None => Ok(()),
        }
    }

    /// Drop a service locally
    pub async fn remove_service(&self, key: &str) -> Option<Datum> {
        let removed = self.store.remove(key).await;
        if removed.is_some() {
            self.notifier.add_task(key, ChangeKind::Delete);
        }
        removed
    }

    /// Apply a local operation and stamp it with the new datum timestamp.
    ///
    /// With `create` unset an absent key stays absent and `None` is returned.
    async fn apply_local(
        &self,
        key: &str,
        mut operation: InstanceOperation,
        create: bool,
    ) -> Result<Option<InstanceOperation>> {
        let apply = |datum: &mut Datum| {
            let timestamp = now_millis().max(datum.timestamp + 1);
            let instances = datum.value.as_instances_mut()?;
            operation.apply_to(instances);
            datum.timestamp = timestamp;
            Some(timestamp)
        };

        let stamped = if create {
            Some(
                self.store
                    .update(key, || Datum::empty_instances(key), apply)
                    .await,
            )
        } else {
            self.store.update_existing(key, apply).await
        };

        match stamped {
            None => Ok(None),
            Some(Some(timestamp)) => {
                operation.timestamp = timestamp;
                self.notifier.add_task(key, ChangeKind::Change);
                Ok(Some(operation))
            }
            Some(None) => Err(Error::Unsupported(format!(
                "{} does not hold an instance list",
                key
            ))),
        }
    }

    async fn distribute(
        &self,
        key: &str,
        operation: InstanceOperation,
        kind: DataOperation,
    ) -> Result<()> {
        let mut operations = BTreeMap::new();
        operations.insert(key.to_string(), operation);
        let content = self.codec.encode(&operations)?;
        let payload = SyncPayload::new(SyncKey::Single(key.to_string()), content, kind);

        self.push_to_peers(payload).await;
        Ok(())
    }

    /// Push `payload` to every peer; failures are logged per peer
    async fn push_to_peers(&self, payload: SyncPayload) {
        let peers = self.members.all_members_without_self().await;
        if peers.is_empty() {
            return;
        }

        if self.transport.supports_callback_transport() {
            for peer in &peers {
                let callback = Arc::new(LoggingCallback {
                    key: payload.key.clone(),
                    target: peer.address.clone(),
                });
                let sent = match payload.operation {
                    DataOperation::Verify => {
                        self.transport
                            .sync_verify_data_with_callback(payload.clone(), &peer.address, callback)
                            .await
                    }
                    _ => {
                        self.transport
                            .sync_data_with_callback(payload.clone(), &peer.address, callback)
                            .await
                    }
                };
                if let Err(e) = sent {
                    tracing::warn!("Distro push to {} not sent: {}", peer.address, e);
                }
            }
            return;
        }

        let pushes = peers.iter().map(|peer| {
            let payload = payload.clone();
            async move {
                let ok = match payload.operation {
                    DataOperation::Verify => {
                        self.transport.sync_verify_data(payload, &peer.address).await
                    }
                    _ => self.transport.sync_data(payload, &peer.address).await,
                };
                (peer.address.as_str(), ok)
            }
        });

        for (address, ok) in join_all(pushes).await {
            if !ok {
                tracing::debug!("Distro push of {} to {} did not succeed", payload.key, address);
            }
        }
    }

    // ========== Incoming data ==========

    /// Apply a payload received from `source`.
    ///
    /// A checksum digest is only decoded here; its verify round runs on a
    /// spawned task so the sender is answered without waiting for repairs.
    pub async fn process_data(&self, payload: SyncPayload, source: &str) -> Result<()> {
        tracing::trace!(
            "Processing {} payload {} from {}",
            payload.operation,
            payload.key,
            source
        );

        match payload.operation {
            DataOperation::Sync => {
                let datums: BTreeMap<ResourceKey, Datum> = self.codec.decode(&payload.content)?;
                for (key, incoming) in datums {
                    let mut created = false;
                    let outcome = self
                        .store
                        .update(
                            &key,
                            || {
                                created = true;
                                incoming.clone()
                            },
                            |current| self.grow_only.merge(current, &incoming),
                        )
                        .await;
                    if created || outcome.changed() {
                        self.notifier.add_task(&key, ChangeKind::Change);
                    }
                }
                Ok(())
            }
            DataOperation::Add | DataOperation::Remove => {
                let operations: BTreeMap<ResourceKey, InstanceOperation> =
                    self.codec.decode(&payload.content)?;
                for (key, operation) in operations {
                    let merge = |current: &mut Datum| self.add_wins.merge(current, &operation);
                    let outcome = match operation.kind {
                        OperationKind::Add => Some(
                            self.store
                                .update(&key, || Datum::empty_instances(key.clone()), merge)
                                .await,
                        ),
                        // Removing from an unknown key has nothing to do
                        OperationKind::Remove => self.store.update_existing(&key, merge).await,
                    };
                    if outcome.map_or(false, |o| o.changed()) {
                        self.notifier.add_task(&key, ChangeKind::Change);
                    }
                }
                Ok(())
            }
            DataOperation::Verify => {
                let checksums: BTreeMap<ResourceKey, String> =
                    self.codec.decode(&payload.content)?;
                self.receive_checksums(checksums, source);
                Ok(())
            }
            DataOperation::Snapshot => self.process_snapshot(payload).await,
        }
    }

    /// Run a verify round for `source`'s digest on its own task
    pub fn receive_checksums(&self, checksums: BTreeMap<ResourceKey, String>, source: &str) {
        let verifier = Arc::clone(&self.verifier);
        let source = source.to_string();
        tokio::spawn(async move {
            if let Err(e) = verifier.verify(checksums, &source).await {
                tracing::warn!("Verify round from {} failed: {}", source, e);
            }
        });
    }

    /// Compare a peer's checksum digest with the local store and repair,
    /// waiting for the repair to finish.
    ///
    /// Returns `false` when the round was skipped: another round from the
    /// same source is running, or the digest names a key this node owns.
    pub async fn process_verify_data(
        &self,
        checksums: BTreeMap<ResourceKey, String>,
        source: &str,
    ) -> Result<bool> {
        self.verifier.verify(checksums, source).await
    }

    /// Apply a full-store snapshot, replacing every datum it carries
    pub async fn process_snapshot(&self, payload: SyncPayload) -> Result<()> {
        let datums: BTreeMap<ResourceKey, Datum> = self.codec.decode(&payload.content)?;
        let count = datums.len();
        for (_, datum) in datums {
            self.verifier.replace(datum).await;
        }
        tracing::info!("Applied snapshot with {} datums", count);
        Ok(())
    }

    // ========== Background work ==========

    /// Send the checksum digest of owned keys to every peer.
    ///
    /// Does nothing before the initial load finished.
    pub async fn verify_round(&self) -> Result<()> {
        if !self.storage.is_initial_load_done() {
            tracing::debug!("Initial load not finished, skipping verify round");
            return Ok(());
        }

        for payload in self.storage.get_verify_data().await? {
            self.push_to_peers(payload).await;
        }
        Ok(())
    }

    /// One cold-start attempt: apply the first snapshot a peer returns.
    ///
    /// Returns `true` once the initial load is done.
    pub async fn load_snapshot(&self) -> bool {
        if self.storage.is_initial_load_done() {
            return true;
        }

        let peers = self.members.all_members_without_self().await;
        if peers.is_empty() {
            tracing::info!("No peers to load from, starting with an empty store");
            self.storage.mark_initial_load_done();
            return true;
        }

        for peer in peers {
            let loaded = match self.transport.get_snapshot(&peer.address).await {
                Ok(payload) => self.process_snapshot(payload).await,
                Err(e) => Err(e),
            };
            match loaded {
                Ok(()) => {
                    tracing::info!("Loaded snapshot from {}", peer.address);
                    self.storage.mark_initial_load_done();
                    return true;
                }
                Err(e) => tracing::warn!("Snapshot load from {} failed: {}", peer.address, e),
            }
        }
        false
    }

    /// Re-derive ownership after the member list changed and adopt keys
    /// this node now owns but does not hold
    pub async fn on_membership_change(&self, addresses: Vec<String>) -> Result<usize> {
        let before = self.mapper.members();
        self.mapper.update_members(addresses);
        let after = self.mapper.members();

        if let Some(connections) = &self.connections {
            connections.reconcile(&self.members.all_members().await).await;
        }

        let departed = before.iter().any(|m| !after.contains(m));
        if !departed {
            return Ok(0);
        }

        let peers = self.members.all_members_without_self().await;
        for peer in peers.iter().filter(|p| p.is_up()) {
            let payload = match self.transport.get_snapshot(&peer.address).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Snapshot pull from {} failed: {}", peer.address, e);
                    continue;
                }
            };

            let datums: BTreeMap<ResourceKey, Datum> = self.codec.decode(&payload.content)?;
            let mut adopted = 0;
            for (key, datum) in datums {
                if !self.mapper.is_responsible(&key) {
                    continue;
                }
                // Insert only if absent, under the same lock as local writes
                let mut inserted = false;
                self.store
                    .update(
                        &key,
                        || {
                            inserted = true;
                            datum
                        },
                        |_| (),
                    )
                    .await;
                if inserted {
                    self.notifier.add_task(&key, ChangeKind::Change);
                    adopted += 1;
                }
            }
            if adopted > 0 {
                tracing::info!("Adopted {} newly owned keys from {}", adopted, peer.address);
            }
            return Ok(adopted);
        }

        Err(Error::Network(
            "no peer answered the ownership snapshot pull".into(),
        ))
    }

    /// Spawn the cold-start loader, the verify loop, the membership watcher
    /// and the change notifier
    pub fn start(self: &Arc<Self>, mut changes: watch::Receiver<Vec<String>>) {
        let notifier = Arc::clone(&self.notifier);
        let store = Arc::clone(&self.store);
        let shutdown = self.shutdown.subscribe();
        tokio::spawn(async move { notifier.run(store, shutdown).await });

        let protocol = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            while !protocol.load_snapshot().await {
                tokio::select! {
                    _ = tokio::time::sleep(protocol.options.load_retry_delay) => {}
                    _ = shutdown.changed() => return,
                }
            }
        });

        let protocol = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(protocol.options.verify_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = protocol.verify_round().await {
                            tracing::warn!("Verify round failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        let protocol = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let addresses = changes.borrow_and_update().clone();
                        if let Err(e) = protocol.on_membership_change(addresses).await {
                            tracing::warn!("Membership change handling failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        tracing::info!("Distro protocol started on {}", self.local_address());
    }

    /// Stop the background tasks
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl RequestHandler for DistroProtocol {
    async fn handle(&self, peer: &str, message: Message) -> Message {
        match message {
            Message::DistroData { source, payload } => {
                match self.process_data(payload, &source).await {
                    Ok(()) => Message::ok(None),
                    Err(e) => {
                        tracing::warn!("Failed to process Distro data from {}: {}", source, e);
                        Message::failed(e.to_string())
                    }
                }
            }
            Message::DistroQuery { key } => match self.storage.get_data(&key).await {
                Ok(payload) => Message::ok(Some(payload)),
                Err(e) => Message::failed(e.to_string()),
            },
            Message::DistroSnapshot => match self.storage.get_snapshot().await {
                Ok(payload) => Message::ok(Some(payload)),
                Err(e) => Message::failed(e.to_string()),
            },
            other => {
                tracing::warn!("Unexpected {} from {}", other.type_name(), peer);
                Message::Error {
                    code: ErrorCode::Unsupported,
                    message: format!("Unexpected request {}", other.type_name()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterMembership, MemberState};
    use crate::distro::mapper::responsible;
    use crate::distro::notifier::testing::RecordingListener;
    use std::collections::HashMap;
    use std::future::Future;
    use std::sync::{RwLock, Weak};

    /// Poll `check` until it holds or a second has passed
    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn has_timestamp(protocol: &DistroProtocol, key: &str, timestamp: u64) -> bool {
        protocol.store().get(key).await.map(|d| d.timestamp) == Some(timestamp)
    }

    async fn lacks(protocol: &DistroProtocol, key: &str) -> bool {
        !protocol.store().contains(key).await
    }

    /// In-process network connecting protocols by address
    #[derive(Default)]
    struct Loopback {
        nodes: RwLock<HashMap<String, Weak<DistroProtocol>>>,
    }

    impl Loopback {
        fn node(&self, address: &str) -> Result<Arc<DistroProtocol>> {
            self.nodes
                .read()
                .unwrap()
                .get(address)
                .and_then(Weak::upgrade)
                .ok_or_else(|| Error::transport(address, "unreachable"))
        }
    }

    struct LoopbackAgent {
        local: String,
        members: Arc<dyn MemberSource>,
        network: Arc<Loopback>,
    }

    impl LoopbackAgent {
        async fn call(&self, target: &str, message: Message) -> Result<Message> {
            let node = self.network.node(target)?;
            Ok(node.handle(&self.local, message).await)
        }

        async fn push(&self, payload: SyncPayload, target: &str) -> bool {
            if !self.members.has_member(target).await {
                return true;
            }
            let message = Message::DistroData {
                source: self.local.clone(),
                payload,
            };
            matches!(
                self.call(target, message).await,
                Ok(Message::DistroResponse { success: true, .. })
            )
        }

        async fn pull(&self, target: &str, message: Message) -> Result<SyncPayload> {
            match self.call(target, message).await? {
                Message::DistroResponse {
                    success: true,
                    payload: Some(payload),
                    ..
                } => Ok(payload),
                _ => Err(Error::transport(target, "bad reply")),
            }
        }
    }

    #[async_trait]
    impl DistroTransportAgent for LoopbackAgent {
        fn supports_callback_transport(&self) -> bool {
            false
        }

        async fn sync_data(&self, payload: SyncPayload, target: &str) -> bool {
            self.push(payload, target).await
        }

        async fn sync_data_with_callback(
            &self,
            _payload: SyncPayload,
            _target: &str,
            _callback: Arc<dyn DistroCallback>,
        ) -> Result<()> {
            Err(Error::Unsupported("loopback".into()))
        }

        async fn sync_verify_data(&self, payload: SyncPayload, target: &str) -> bool {
            self.push(payload, target).await
        }

        async fn sync_verify_data_with_callback(
            &self,
            _payload: SyncPayload,
            _target: &str,
            _callback: Arc<dyn DistroCallback>,
        ) -> Result<()> {
            Err(Error::Unsupported("loopback".into()))
        }

        async fn get_data(&self, key: &SyncKey, target: &str) -> Result<SyncPayload> {
            self.pull(target, Message::DistroQuery { key: key.clone() }).await
        }

        async fn get_snapshot(&self, target: &str) -> Result<SyncPayload> {
            self.pull(target, Message::DistroSnapshot).await
        }
    }

    struct Node {
        protocol: Arc<DistroProtocol>,
        membership: Arc<ClusterMembership>,
    }

    fn addresses() -> Vec<String> {
        vec!["n1:7848".into(), "n2:7848".into(), "n3:7848".into()]
    }

    fn cluster(addresses: &[String]) -> (Arc<Loopback>, Vec<Node>) {
        let network = Arc::new(Loopback::default());
        let mut nodes = Vec::new();

        for address in addresses {
            let membership = Arc::new(ClusterMembership::new(address.clone(), addresses.to_vec()));
            let agent = Arc::new(LoopbackAgent {
                local: address.clone(),
                members: membership.clone(),
                network: Arc::clone(&network),
            });
            let protocol = Arc::new(DistroProtocol::new(
                membership.clone(),
                Arc::new(DataStore::new()),
                Arc::new(DistroMapper::new(address.clone(), addresses.to_vec())),
                agent,
                DistroCodec::default(),
                DistroOptions {
                    max_time_difference: 10,
                    ..DistroOptions::default()
                },
            ));
            network
                .nodes
                .write()
                .unwrap()
                .insert(address.clone(), Arc::downgrade(&protocol));
            nodes.push(Node {
                protocol,
                membership,
            });
        }
        (network, nodes)
    }

    /// First key with the requested owners before and after removing n2
    fn key_owned_by(owner: &str, owner_without_n2: Option<&str>) -> String {
        let all = addresses();
        let remaining: Vec<String> = all.iter().filter(|a| *a != "n2:7848").cloned().collect();
        (0..)
            .map(|i| format!("public##svc:{}", i))
            .find(|key| {
                responsible(key, &all) == Some(owner)
                    && owner_without_n2.map_or(true, |o| responsible(key, &remaining) == Some(o))
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_replicates_to_owner() {
        let (_network, nodes) = cluster(&addresses());
        let key = key_owned_by("n2:7848", None);
        let instance = Instance::new("10.0.0.1", 8080);

        nodes[0]
            .protocol
            .register_instance(&key, instance.clone())
            .await
            .unwrap();

        for node in &nodes {
            let datum = node.protocol.store().get(&key).await.unwrap();
            assert!(datum.value.as_instances().unwrap().contains("10.0.0.1:8080"));
        }
        assert!(nodes[1].protocol.mapper().is_responsible(&key));
    }

    #[tokio::test]
    async fn test_deregister_applies_locally_and_newer_remove_replicates() {
        let (_network, nodes) = cluster(&addresses());
        let key = key_owned_by("n1:7848", None);
        let instance = Instance::new("10.0.0.1", 8080);

        // Peers hold the instance at an old timestamp
        for node in &nodes[1..] {
            let mut datum = Datum::empty_instances(key.clone());
            datum.value.as_instances_mut().unwrap().add(&[instance.clone()]);
            datum.timestamp = 1;
            node.protocol.store().put(datum).await;
        }
        nodes[0].protocol.store().put({
            let mut datum = Datum::empty_instances(key.clone());
            datum.value.as_instances_mut().unwrap().add(&[instance.clone()]);
            datum.timestamp = 1;
            datum
        })
        .await;

        nodes[0]
            .protocol
            .deregister_instance(&key, instance)
            .await
            .unwrap();

        for node in &nodes {
            let datum = node.protocol.store().get(&key).await.unwrap();
            assert!(datum.value.as_instances().unwrap().is_empty());
            assert!(datum.timestamp > 1);
        }
    }

    #[tokio::test]
    async fn test_sync_payload_merges_grow_only() {
        let (_network, nodes) = cluster(&addresses());
        let receiver = &nodes[0].protocol;

        let mut current = Datum::empty_instances("svc:A");
        current.value.as_instances_mut().unwrap().add(&[Instance::new("10.0.0.1", 80)]);
        current.timestamp = 100;
        receiver.store().put(current).await;

        let mut incoming = Datum::empty_instances("svc:A");
        incoming.value.as_instances_mut().unwrap().add(&[Instance::new("10.0.0.2", 80)]);
        incoming.timestamp = 104;
        let mut map = BTreeMap::new();
        map.insert("svc:A".to_string(), incoming);

        let content = DistroCodec::default().encode(&map).unwrap();
        receiver
            .process_data(
                SyncPayload::new(SyncKey::Single("svc:A".into()), content, DataOperation::Sync),
                "n2:7848",
            )
            .await
            .unwrap();

        let datum = receiver.store().get("svc:A").await.unwrap();
        assert_eq!(datum.value.as_instances().unwrap().len(), 2);
        assert_eq!(datum.timestamp, 104);
    }

    #[tokio::test]
    async fn test_verify_repairs_divergent_and_removes_orphans() {
        let (_network, nodes) = cluster(&addresses());
        let owner = &nodes[1].protocol;
        let follower = &nodes[0].protocol;
        let changed = key_owned_by("n2:7848", None);
        let orphan = (0..)
            .map(|i| format!("public##orphan:{}", i))
            .find(|k| responsible(k, &addresses()) == Some("n2:7848"))
            .unwrap();

        let mut fresh = Datum::empty_instances(changed.clone());
        fresh.value.as_instances_mut().unwrap().add(&[Instance::new("10.0.0.9", 80)]);
        fresh.timestamp = 500;
        owner.store().put(fresh.clone()).await;

        follower.store().put(Datum::empty_instances(changed.clone())).await;
        follower.store().put(Datum::empty_instances(orphan.clone())).await;

        owner.storage().mark_initial_load_done();
        owner.verify_round().await.unwrap();

        assert!(eventually(|| has_timestamp(follower, &changed, 500)).await);
        let repaired = follower.store().get(&changed).await.unwrap();
        assert_eq!(repaired.checksum(), fresh.checksum());
        assert!(eventually(|| lacks(follower, &orphan)).await);
    }

    #[tokio::test]
    async fn test_verify_round_waits_for_initial_load() {
        let (_network, nodes) = cluster(&addresses());
        let key = key_owned_by("n1:7848", None);
        nodes[0].protocol.store().put(Datum::empty_instances(key.clone())).await;

        nodes[0].protocol.verify_round().await.unwrap();
        assert!(!nodes[1].protocol.store().contains(&key).await);

        nodes[0].protocol.storage().mark_initial_load_done();
        nodes[0].protocol.verify_round().await.unwrap();
        assert!(eventually(|| has_timestamp(&nodes[1].protocol, &key, 0)).await);
    }

    #[tokio::test]
    async fn test_verify_digest_is_acked_before_repair() {
        let (network, nodes) = cluster(&addresses());
        let key = key_owned_by("n2:7848", None);

        let mut digest = BTreeMap::new();
        digest.insert(key.clone(), "deadbeef".to_string());
        let content = DistroCodec::default().encode(&digest).unwrap();

        // The sender cannot be reached for the pull, the push is still acked
        network.nodes.write().unwrap().remove("n2:7848");
        let reply = tokio::time::timeout(
            Duration::from_secs(1),
            nodes[0].protocol.handle(
                "n2:7848",
                Message::DistroData {
                    source: "n2:7848".into(),
                    payload: SyncPayload::new(
                        SyncKey::Single(key.clone()),
                        content,
                        DataOperation::Verify,
                    ),
                },
            ),
        )
        .await
        .unwrap();

        assert!(matches!(reply, Message::DistroResponse { success: true, .. }));
        assert!(!nodes[0].protocol.store().contains(&key).await);
    }

    #[tokio::test]
    async fn test_verify_aborts_on_owned_key() {
        let (_network, nodes) = cluster(&addresses());
        let key = key_owned_by("n1:7848", None);

        let mut digest = BTreeMap::new();
        digest.insert(key.clone(), "deadbeef".to_string());
        let ran = nodes[0]
            .protocol
            .process_verify_data(digest, "n2:7848")
            .await
            .unwrap();
        assert!(!ran);
        assert!(!nodes[0].protocol.store().contains(&key).await);
    }

    #[tokio::test]
    async fn test_duplicate_verify_round_is_dropped() {
        let (_network, nodes) = cluster(&addresses());
        let protocol = &nodes[0].protocol;

        let _running = VerifyRound::begin(&protocol.verifier.rounds, "n2:7848").unwrap();
        let ran = protocol
            .process_verify_data(BTreeMap::new(), "n2:7848")
            .await
            .unwrap();
        assert!(!ran);

        assert!(protocol
            .process_verify_data(BTreeMap::new(), "n3:7848")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_load_snapshot() {
        let (_network, nodes) = cluster(&addresses());
        nodes[1].protocol.store().put(Datum::empty_instances("svc:A")).await;

        assert!(nodes[0].protocol.load_snapshot().await);
        assert!(nodes[0].protocol.storage().is_initial_load_done());
        assert!(nodes[0].protocol.store().contains("svc:A").await);
    }

    #[tokio::test]
    async fn test_load_snapshot_alone_and_unreachable() {
        let (_network, alone) = cluster(&["n1:7848".to_string()]);
        assert!(alone[0].protocol.load_snapshot().await);

        let (network, nodes) = cluster(&addresses());
        network.nodes.write().unwrap().clear();
        assert!(!nodes[0].protocol.load_snapshot().await);
        assert!(!nodes[0].protocol.storage().is_initial_load_done());
    }

    #[tokio::test]
    async fn test_new_owner_adopts_missing_keys() {
        let (network, nodes) = cluster(&addresses());
        let key = key_owned_by("n2:7848", Some("n3:7848"));

        let mut datum = Datum::empty_instances(key.clone());
        datum.value.as_instances_mut().unwrap().add(&[Instance::new("10.0.0.1", 80)]);
        datum.timestamp = 10;
        nodes[0].protocol.store().put(datum.clone()).await;
        nodes[1].protocol.store().put(datum).await;

        // n2 fails and leaves
        network.nodes.write().unwrap().remove("n2:7848");
        for node in &nodes {
            node.membership.remove_member("n2:7848").await;
        }

        let remaining = vec!["n1:7848".to_string(), "n3:7848".to_string()];
        let adopted = nodes[2]
            .protocol
            .on_membership_change(remaining.clone())
            .await
            .unwrap();

        assert_eq!(adopted, 1);
        assert!(nodes[2].protocol.mapper().is_responsible(&key));
        assert!(nodes[2].protocol.store().contains(&key).await);

        // n1 already holds it
        assert_eq!(
            nodes[0].protocol.on_membership_change(remaining).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_down_member_hands_keys_to_live_owner() {
        let (_network, nodes) = cluster(&addresses());
        let key = key_owned_by("n2:7848", Some("n3:7848"));

        let mut datum = Datum::empty_instances(key.clone());
        datum.value.as_instances_mut().unwrap().add(&[Instance::new("10.0.0.1", 80)]);
        datum.timestamp = 10;
        nodes[0].protocol.store().put(datum).await;

        // n2 stays in the table but is marked down
        nodes[2]
            .membership
            .set_state("n2:7848", MemberState::Down)
            .await;
        let live = nodes[2].membership.live_members();
        assert!(!live.contains(&"n2:7848".to_string()));

        let adopted = nodes[2].protocol.on_membership_change(live).await.unwrap();
        assert_eq!(adopted, 1);
        assert_eq!(
            nodes[2].protocol.mapper().map_server(&key).as_deref(),
            Some("n3:7848")
        );
        assert!(nodes[2].protocol.store().contains(&key).await);
    }

    #[tokio::test]
    async fn test_adoption_keeps_local_datum() {
        let (network, nodes) = cluster(&addresses());
        let key = key_owned_by("n2:7848", Some("n3:7848"));

        let mut stale = Datum::empty_instances(key.clone());
        stale.timestamp = 10;
        nodes[0].protocol.store().put(stale).await;

        let mut local = Datum::empty_instances(key.clone());
        local.value.as_instances_mut().unwrap().add(&[Instance::new("10.0.0.5", 80)]);
        local.timestamp = 20;
        nodes[2].protocol.store().put(local.clone()).await;

        network.nodes.write().unwrap().remove("n2:7848");
        let remaining = vec!["n1:7848".to_string(), "n3:7848".to_string()];
        let adopted = nodes[2]
            .protocol
            .on_membership_change(remaining)
            .await
            .unwrap();

        assert_eq!(adopted, 0);
        assert_eq!(nodes[2].protocol.store().get(&key).await, Some(local));
    }

    #[tokio::test]
    async fn test_removal_of_unknown_key_does_not_create_it() {
        let (_network, nodes) = cluster(&addresses());
        let instance = Instance::new("10.0.0.1", 80);

        nodes[0]
            .protocol
            .deregister_instance("svc:absent", instance.clone())
            .await
            .unwrap();
        assert!(!nodes[0].protocol.store().contains("svc:absent").await);

        let mut operations = BTreeMap::new();
        operations.insert(
            "svc:gone".to_string(),
            InstanceOperation::remove(vec![instance], now_millis()),
        );
        let content = DistroCodec::default().encode(&operations).unwrap();
        nodes[0]
            .protocol
            .process_data(
                SyncPayload::new(SyncKey::Single("svc:gone".into()), content, DataOperation::Remove),
                "n2:7848",
            )
            .await
            .unwrap();
        assert!(!nodes[0].protocol.store().contains("svc:gone").await);
    }

    #[tokio::test]
    async fn test_listener_sees_local_and_replicated_writes() {
        let (_network, nodes) = cluster(&addresses());
        let key = key_owned_by("n1:7848", None);
        let listener = Arc::new(RecordingListener::default());
        nodes[1].protocol.listen(&key, listener.clone());

        let (stop, shutdown) = watch::channel(false);
        let notifier = Arc::clone(&nodes[1].protocol.notifier);
        let store = Arc::clone(nodes[1].protocol.store());
        let dispatcher = tokio::spawn(async move { notifier.run(store, shutdown).await });

        nodes[0]
            .protocol
            .register_instance(&key, Instance::new("10.0.0.1", 80))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), listener.notify.notified())
            .await
            .unwrap();

        let changes = listener.changes.lock().unwrap().clone();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, key);

        nodes[1].protocol.remove_service(&key).await;
        tokio::time::timeout(Duration::from_secs(1), listener.notify.notified())
            .await
            .unwrap();
        assert_eq!(*listener.deletes.lock().unwrap(), vec![key.clone()]);

        stop.send(true).unwrap();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_rejects_unexpected_messages() {
        let (_network, nodes) = cluster(&addresses());
        let reply = nodes[0]
            .protocol
            .handle("n2:7848", Message::HeartBeatResponse)
            .await;
        assert!(matches!(
            reply,
            Message::Error {
                code: ErrorCode::Unsupported,
                ..
            }
        ));
    }
}
