//! Distro Replication
//!
//! Leaderless replication of ephemeral registry data. Every key has one
//! owner derived from the member list; all nodes hold all data, owners
//! periodically announce checksums and peers repair from them.

pub mod codec;
pub mod data;
pub mod mapper;
pub mod notifier;
pub mod protocol;
pub mod resolver;
pub mod storage;
pub mod transport;

pub use codec::{DistroCodec, WireFormat};
pub use data::{DataOperation, SyncKey, SyncPayload};
pub use mapper::{responsible, DistroMapper};
pub use notifier::{ChangeKind, Notifier, RecordListener};
pub use protocol::{DistroOptions, DistroProtocol};
pub use resolver::{AddWinsResolver, GrowOnlyResolver, MergeOutcome};
pub use storage::DistroDataStorage;
pub use transport::{
    DistroCallback, DistroTransportAgent, HttpTransportAgent, RpcTransportAgent,
};
