//! WolfRegistry - Clustered Service Registry
//!
//! A service-registry node whose ephemeral instance data is replicated with
//! Distro, a leaderless, partition-tolerant protocol. Every node holds all
//! data and accepts writes; each key has one owner derived from the member
//! list, and owners periodically publish checksums so peers can detect and
//! repair divergence.
//!
//! # Architecture
//!
//! - [`store`] holds the replicated records in memory.
//! - [`distro`] partitions ownership, produces sync payloads, resolves
//!   conflicts and drives replication.
//! - [`cluster`] tracks members and keeps one connection per peer for the
//!   RPC transport.
//! - [`network`] frames messages over TCP and serves peer requests.
//! - [`api`] exposes the HTTP transport endpoints and a registry REST API.
//!
//! # Features
//!
//! - Rendezvous-hash ownership with minimal key movement on churn
//! - Add-wins and grow-only conflict resolution bounded by clock skew
//! - Checksum-driven anti-entropy with targeted repair pulls
//! - Snapshot cold start and ownership hand-over on member loss
//! - HTTP or framed-TCP transport chosen at startup

pub mod api;
pub mod cluster;
pub mod config;
pub mod distro;
pub mod error;
pub mod network;
pub mod store;

pub use config::RegistryConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::cluster::{ClusterConnectionManager, ClusterMembership, Member, MemberSource};
    pub use crate::config::RegistryConfig;
    pub use crate::distro::{
        DistroCodec, DistroMapper, DistroProtocol, DistroTransportAgent, RecordListener, SyncKey,
        SyncPayload,
    };
    pub use crate::error::{Error, Result};
    pub use crate::store::{DataStore, Datum, Instance, Instances};
}
