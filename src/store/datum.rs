//! Replicated Records
//!
//! A `Datum` is one replicated registry record. Its value is a tagged
//! variant so resolvers can match on the payload shape they understand.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Key identifying a replicated resource, e.g. `public##svc:A`
pub type ResourceKey = String;

/// One registered service endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    /// Endpoint IP or hostname
    pub ip: String,
    /// Endpoint port
    pub port: u16,
    /// Custom identity overriding `ip:port`
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Ephemeral instances live only as long as their client session
    #[serde(default = "default_true")]
    pub ephemeral: bool,
    #[serde(default = "default_true")]
    pub healthy: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

impl Instance {
    /// Create a healthy, enabled, ephemeral instance with weight 1
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            instance_id: None,
            ephemeral: true,
            healthy: true,
            enabled: true,
            weight: default_weight(),
            metadata: BTreeMap::new(),
        }
    }

    /// Identity of this instance within its service
    pub fn identity(&self) -> String {
        match &self.instance_id {
            Some(id) => id.clone(),
            None => format!("{}:{}", self.ip, self.port),
        }
    }

    fn render(&self, out: &mut String) {
        let _ = write!(
            out,
            "{}|{}:{}|{}|{}|{}|{}|",
            self.identity(),
            self.ip,
            self.port,
            self.ephemeral,
            self.healthy,
            self.enabled,
            self.weight
        );
        for (k, v) in &self.metadata {
            let _ = write!(out, "{}={};", k, v);
        }
        out.push('\n');
    }
}

/// The instance collection of one service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Instances {
    instances: BTreeMap<String, Instance>,
}

impl Instances {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite instances by identity
    pub fn add<'a>(&mut self, instances: impl IntoIterator<Item = &'a Instance>) {
        for instance in instances {
            self.instances.insert(instance.identity(), instance.clone());
        }
    }

    /// Remove instances by identity
    pub fn remove<'a>(&mut self, instances: impl IntoIterator<Item = &'a Instance>) {
        for instance in instances {
            self.instances.remove(&instance.identity());
        }
    }

    /// Union with `other`. Entries already present are kept unless `prefer_other` is set.
    pub fn union(&mut self, other: &Instances, prefer_other: bool) {
        for (id, instance) in &other.instances {
            if prefer_other || !self.instances.contains_key(id) {
                self.instances.insert(id.clone(), instance.clone());
            }
        }
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.instances.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&Instance> {
        self.instances.get(identity)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn identities(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Hex SHA-1 over the canonical rendering of every instance
    pub fn checksum(&self) -> String {
        let mut rendered = String::new();
        for instance in self.instances.values() {
            instance.render(&mut rendered);
        }
        hex::encode(Sha1::digest(rendered.as_bytes()))
    }
}

impl FromIterator<Instance> for Instances {
    fn from_iter<I: IntoIterator<Item = Instance>>(iter: I) -> Self {
        let mut instances = Instances::new();
        for instance in iter {
            instances.instances.insert(instance.identity(), instance);
        }
        instances
    }
}

/// Payload shapes a datum can carry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DatumValue {
    /// Instance list of a service
    Instances(Instances),
    /// Payload of a shape this node does not interpret
    Opaque(Vec<u8>),
}

impl DatumValue {
    pub fn checksum(&self) -> String {
        match self {
            DatumValue::Instances(instances) => instances.checksum(),
            DatumValue::Opaque(bytes) => hex::encode(Sha1::digest(bytes)),
        }
    }

    pub fn as_instances(&self) -> Option<&Instances> {
        match self {
            DatumValue::Instances(instances) => Some(instances),
            DatumValue::Opaque(_) => None,
        }
    }

    pub fn as_instances_mut(&mut self) -> Option<&mut Instances> {
        match self {
            DatumValue::Instances(instances) => Some(instances),
            DatumValue::Opaque(_) => None,
        }
    }
}

/// One replicated record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub key: ResourceKey,
    pub value: DatumValue,
    /// Advances on every local change and on merges; never regresses
    pub timestamp: u64,
}

impl Datum {
    pub fn new(key: impl Into<ResourceKey>, value: DatumValue, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            value,
            timestamp,
        }
    }

    /// Empty instance list at timestamp 0
    pub fn empty_instances(key: impl Into<ResourceKey>) -> Self {
        Self::new(key, DatumValue::Instances(Instances::new()), 0)
    }

    /// Digest derived purely from the value
    pub fn checksum(&self) -> String {
        self.value.checksum()
    }

    /// Advance the timestamp, never moving it backwards
    pub fn advance_timestamp(&mut self, timestamp: u64) {
        if timestamp > self.timestamp {
            self.timestamp = timestamp;
        }
    }
}

/// Kind of a discrete instance operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Add,
    Remove,
}

/// A discrete add or remove of instances, stamped with its origin time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOperation {
    pub kind: OperationKind,
    pub instances: Vec<Instance>,
    pub timestamp: u64,
}

impl InstanceOperation {
    pub fn add(instances: Vec<Instance>, timestamp: u64) -> Self {
        Self {
            kind: OperationKind::Add,
            instances,
            timestamp,
        }
    }

    pub fn remove(instances: Vec<Instance>, timestamp: u64) -> Self {
        Self {
            kind: OperationKind::Remove,
            instances,
            timestamp,
        }
    }

    /// Apply unconditionally (local intent)
    pub fn apply_to(&self, instances: &mut Instances) {
        match self.kind {
            OperationKind::Add => instances.add(&self.instances),
            OperationKind::Remove => instances.remove(&self.instances),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
