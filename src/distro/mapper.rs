//! Ownership Partitioner
//!
//! Maps each resource key to exactly one responsible member using rendezvous
//! (highest random weight) hashing. Every node computes the same owner from
//! the same member list, and dropping a member only moves the keys that
//! member owned.

use std::sync::RwLock;

/// Weight of `member` for `key`
fn weight(member: &str, key: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(member.as_bytes());
    hasher.update(&[0]);
    hasher.update(key.as_bytes());
    hasher.finalize()
}

/// Owner of `key` among `members`, or `None` for an empty list.
///
/// Input order and duplicates do not affect the result.
pub fn responsible<'a>(key: &str, members: &'a [String]) -> Option<&'a str> {
    members
        .iter()
        .map(|m| (weight(m, key), m.as_str()))
        .max_by(|(wa, a), (wb, b)| wa.cmp(wb).then_with(|| b.cmp(a)))
        .map(|(_, member)| member)
}

/// Ownership view of this node over the current member list
pub struct DistroMapper {
    local_address: String,
    members: RwLock<Vec<String>>,
}

impl DistroMapper {
    pub fn new(local_address: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            local_address: local_address.into(),
            members: RwLock::new(normalize(members)),
        }
    }

    /// Replace the member list after a membership change
    pub fn update_members(&self, members: Vec<String>) {
        let members = normalize(members);
        let mut current = match self.members.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *current != members {
            tracing::info!("Distro mapper members updated: {:?}", members);
            *current = members;
        }
    }

    /// Owner of `key`, or `None` when the member list is empty
    pub fn map_server(&self, key: &str) -> Option<String> {
        let members = match self.members.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        responsible(key, &members).map(str::to_string)
    }

    /// Whether this node owns `key`
    pub fn is_responsible(&self, key: &str) -> bool {
        self.map_server(key).as_deref() == Some(self.local_address.as_str())
    }

    pub fn local_address(&self) -> &str {
        &self.local_address
    }

    /// Current member list, sorted
    pub fn members(&self) -> Vec<String> {
        match self.members.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn normalize(mut members: Vec<String>) -> Vec<String> {
    members.sort();
    members.dedup();
    members
}
