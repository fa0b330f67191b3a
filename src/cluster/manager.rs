//! Cluster Connection Manager
//!
//! Owns one long-lived [`ClusterClient`] per peer. Clients are created by
//! [`ClusterConnectionManager::init`] and [`ClusterConnectionManager::reconcile`];
//! lookups never create one.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use super::client::{ClientOptions, ClusterClient};
use super::membership::Member;
use crate::error::{Error, Result};
use crate::network::Message;

/// Per-peer cluster client registry
pub struct ClusterConnectionManager {
    /// This node's address, never connected to
    local_address: String,
    /// Clients keyed by member address
    clients: RwLock<HashMap<String, Arc<ClusterClient>>>,
    /// Options for new clients
    options: ClientOptions,
}

impl ClusterConnectionManager {
    /// Create an empty manager
    pub fn new(local_address: String, options: ClientOptions) -> Self {
        Self {
            local_address,
            clients: RwLock::new(HashMap::new()),
            options,
        }
    }

    /// Client for `address`, if one was created
    pub async fn get_cluster_client(&self, address: &str) -> Option<Arc<ClusterClient>> {
        self.clients.read().await.get(address).cloned()
    }

    /// Create and start a client for every member except this node.
    ///
    /// A client that fails to start is kept; it reconnects on its own.
    pub async fn init(&self, members: &[Member]) {
        for member in members {
            if member.address == self.local_address {
                continue;
            }
            self.create_client(&member.address).await;
        }
    }

    /// Bring the client set in line with `members`: start clients for new
    /// members and shut down clients of departed ones
    pub async fn reconcile(&self, members: &[Member]) {
        let departed: Vec<Arc<ClusterClient>> = {
            let mut clients = self.clients.write().await;
            let stale: Vec<String> = clients
                .keys()
                .filter(|address| !members.iter().any(|m| &m.address == *address))
                .cloned()
                .collect();
            stale
                .iter()
                .filter_map(|address| clients.remove(address))
                .collect()
        };

        for client in departed {
            tracing::info!(
                "Closing cluster client to departed member {}",
                client.target().unwrap_or_default()
            );
            client.shutdown().await;
        }

        self.init(members).await;
    }

    async fn create_client(&self, address: &str) {
        let client = {
            let mut clients = self.clients.write().await;
            if clients.contains_key(address) {
                return;
            }
            let client = Arc::new(ClusterClient::new(self.options.clone()));
            client.init(address);
            clients.insert(address.to_string(), Arc::clone(&client));
            client
        };

        if let Err(e) = client.start().await {
            tracing::warn!("Cluster client to {} not running yet: {}", address, e);
        }
    }

    /// Whether the client for `address` exists and is running
    pub async fn is_running(&self, address: &str) -> bool {
        match self.get_cluster_client(address).await {
            Some(client) => client.is_running(),
            None => false,
        }
    }

    /// Addresses with a client, sorted
    pub async fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.clients.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Send a request through the client for `address`
    pub async fn send_request(
        &self,
        address: &str,
        message: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let client = self
            .get_cluster_client(address)
            .await
            .ok_or_else(|| Error::MemberNotFound(address.to_string()))?;
        client.request(message, timeout).await
    }

    /// Shut down every client
    pub async fn shutdown_all(&self) {
        let clients: Vec<Arc<ClusterClient>> =
            self.clients.write().await.drain().map(|(_, c)| c).collect();
        for client in clients {
            client.shutdown().await;
        }
    }
}
