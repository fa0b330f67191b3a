//! Cluster Module
//!
//! Membership table and the per-peer connections used by the RPC transport.

pub mod client;
pub mod manager;
pub mod membership;

pub use client::{ClientOptions, ClientStatus, ClusterClient};
pub use manager::ClusterConnectionManager;
pub use membership::{ClusterMembership, Member, MemberSource, MemberState};
