//! Cluster Membership
//!
//! Member table consumed read-only by the Distro layer. Discovery and health
//! probing live elsewhere; they drive this table through `add_member`,
//! `remove_member` and `set_state`. The addresses of live members (`Up` or
//! `Suspicious`) are published on a watch channel after every change so the
//! Distro protocol can re-derive ownership.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};

/// Health state of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    /// Member is booting
    Starting,
    /// Member is healthy
    Up,
    /// Member missed heartbeats
    Suspicious,
    /// Member is unreachable
    Down,
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberState::Starting => write!(f, "STARTING"),
            MemberState::Up => write!(f, "UP"),
            MemberState::Suspicious => write!(f, "SUSPICIOUS"),
            MemberState::Down => write!(f, "DOWN"),
        }
    }
}

/// A cluster node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Cluster address (host:port)
    pub address: String,
    /// Current health state
    pub state: MemberState,
    /// When the member was added to the table
    pub joined_at: chrono::DateTime<chrono::Utc>,
}

impl Member {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            state: MemberState::Up,
            joined_at: chrono::Utc::now(),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state == MemberState::Up
    }

    /// Whether the member takes part in key ownership
    pub fn is_live(&self) -> bool {
        matches!(self.state, MemberState::Up | MemberState::Suspicious)
    }
}

/// Read-only view of cluster membership
#[async_trait]
pub trait MemberSource: Send + Sync {
    /// Address of this node
    fn local_address(&self) -> &str;

    /// All members including this node, sorted by address
    async fn all_members(&self) -> Vec<Member>;

    /// All members except this node, sorted by address
    async fn all_members_without_self(&self) -> Vec<Member>;

    /// Whether `address` is currently a member
    async fn has_member(&self, address: &str) -> bool;

    /// Look up a member
    async fn find(&self, address: &str) -> Option<Member>;
}

/// In-memory member table
pub struct ClusterMembership {
    /// This node's address
    local_address: String,
    /// All known members (including self), ordered by address
    members: RwLock<BTreeMap<String, Member>>,
    /// Publishes the sorted live member address list after each change
    changes: watch::Sender<Vec<String>>,
}

impl ClusterMembership {
    /// Create a membership table seeded with `members`; self is always present
    pub fn new(local_address: String, members: Vec<String>) -> Self {
        let mut table = BTreeMap::new();
        table.insert(local_address.clone(), Member::new(local_address.clone()));
        for address in members {
            table
                .entry(address.clone())
                .or_insert_with(|| Member::new(address));
        }

        let (changes, _) = watch::channel(live_addresses(&table));

        Self {
            local_address,
            members: RwLock::new(table),
            changes,
        }
    }

    /// Subscribe to membership changes
    pub fn subscribe(&self) -> watch::Receiver<Vec<String>> {
        self.changes.subscribe()
    }

    /// Add a member; returns false if it was already present
    pub async fn add_member(&self, address: String) -> bool {
        let mut members = self.members.write().await;
        if members.contains_key(&address) {
            return false;
        }
        tracing::info!("Member {} joined", address);
        members.insert(address.clone(), Member::new(address));
        self.publish(&members);
        true
    }

    /// Remove a member; this node cannot be removed
    pub async fn remove_member(&self, address: &str) -> Option<Member> {
        if address == self.local_address {
            tracing::warn!("Refusing to remove self ({}) from membership", address);
            return None;
        }
        let mut members = self.members.write().await;
        let removed = members.remove(address);
        if removed.is_some() {
            tracing::info!("Member {} left", address);
            self.publish(&members);
        }
        removed
    }

    /// Update a member's health state; republishes when the live set changed
    pub async fn set_state(&self, address: &str, state: MemberState) {
        let mut members = self.members.write().await;
        let Some(member) = members.get_mut(address) else {
            return;
        };
        if member.state == state {
            return;
        }

        let was_live = member.is_live();
        tracing::info!("Member {} state {} -> {}", address, member.state, state);
        member.state = state;
        if member.is_live() != was_live {
            self.publish(&members);
        }
    }

    /// Addresses currently taking part in key ownership
    pub fn live_members(&self) -> Vec<String> {
        self.changes.borrow().clone()
    }

    /// Number of members including self
    pub async fn size(&self) -> usize {
        self.members.read().await.len()
    }

    fn publish(&self, members: &BTreeMap<String, Member>) {
        self.changes.send_replace(live_addresses(members));
    }
}

fn live_addresses(members: &BTreeMap<String, Member>) -> Vec<String> {
    members
        .values()
        .filter(|m| m.is_live())
        .map(|m| m.address.clone())
        .collect()
}

#[async_trait]
impl MemberSource for ClusterMembership {
    fn local_address(&self) -> &str {
        &self.local_address
    }

    async fn all_members(&self) -> Vec<Member> {
        self.members.read().await.values().cloned().collect()
    }

    async fn all_members_without_self(&self) -> Vec<Member> {
        self.members
            .read()
            .await
            .values()
            .filter(|m| m.address != self.local_address)
            .cloned()
            .collect()
    }

    async fn has_member(&self, address: &str) -> bool {
        self.members.read().await.contains_key(address)
    }

    async fn find(&self, address: &str) -> Option<Member> {
        self.members.read().await.get(address).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> ClusterMembership {
        ClusterMembership::new(
            "n1:7848".to_string(),
            vec!["n2:7848".to_string(), "n3:7848".to_string()],
        )
    }

    #[tokio::test]
    async fn test_members_include_self() {
        let cluster = membership();
        assert_eq!(cluster.size().await, 3);
        assert!(cluster.has_member("n1:7848").await);

        let peers = cluster.all_members_without_self().await;
        let addresses: Vec<_> = peers.iter().map(|m| m.address.as_str()).collect();
        assert_eq!(addresses, vec!["n2:7848", "n3:7848"]);
    }

    #[tokio::test]
    async fn test_remove_member_publishes_change() {
        let cluster = membership();
        let mut rx = cluster.subscribe();

        assert!(cluster.remove_member("n2:7848").await.is_some());
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            vec!["n1:7848".to_string(), "n3:7848".to_string()]
        );
        assert!(!cluster.has_member("n2:7848").await);
    }

    #[tokio::test]
    async fn test_cannot_remove_self() {
        let cluster = membership();
        assert!(cluster.remove_member("n1:7848").await.is_none());
        assert!(cluster.has_member("n1:7848").await);
    }

    #[tokio::test]
    async fn test_set_state() {
        let cluster = membership();
        cluster.set_state("n2:7848", MemberState::Down).await;
        assert!(!cluster.find("n2:7848").await.unwrap().is_up());
        assert!(!cluster.add_member("n2:7848".to_string()).await);
    }

    #[tokio::test]
    async fn test_down_member_leaves_published_list() {
        let cluster = membership();
        let mut rx = cluster.subscribe();

        cluster.set_state("n2:7848", MemberState::Down).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(
            *rx.borrow_and_update(),
            vec!["n1:7848".to_string(), "n3:7848".to_string()]
        );
        assert!(cluster.has_member("n2:7848").await);

        // Suspicious members still own keys
        cluster.set_state("n2:7848", MemberState::Suspicious).await;
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().len(), 3);

        cluster.set_state("n2:7848", MemberState::Up).await;
        assert!(!rx.has_changed().unwrap());
        assert_eq!(cluster.live_members().len(), 3);
    }
}
