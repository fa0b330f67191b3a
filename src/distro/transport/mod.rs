//! Distro Transport Agents
//!
//! Moves sync payloads between peers. Two bindings exist and one is chosen at
//! startup: [`HttpTransportAgent`] (blocking request/response, no callbacks)
//! and [`RpcTransportAgent`] (framed TCP over the cluster connection manager,
//! callback capable).
//!
//! Pushing to a target that is no longer a member succeeds without sending.
//! Pull failures, including replies whose content does not decode, are
//! reported as [`Error::Transport`] so callers can tell "nothing to sync"
//! from "sync failed".

mod http;
mod rpc;

pub use http::{DatumPush, DatumQuery, HttpTransportAgent};
pub use rpc::RpcTransportAgent;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::codec::DistroCodec;
use super::data::{SyncKey, SyncPayload};
use crate::error::{Error, Result};
use crate::store::{Datum, ResourceKey};

/// Completion callback for non-blocking pushes
pub trait DistroCallback: Send + Sync {
    fn on_success(&self);

    /// `None` when the peer answered but rejected the payload
    fn on_failed(&self, error: Option<Error>);
}

/// Peer-to-peer payload transport
#[async_trait]
pub trait DistroTransportAgent: Send + Sync {
    /// Whether the `*_with_callback` operations are available
    fn supports_callback_transport(&self) -> bool;

    /// Push data and wait for the peer's answer
    async fn sync_data(&self, payload: SyncPayload, target: &str) -> bool;

    /// Push data without waiting; the outcome goes to `callback`
    async fn sync_data_with_callback(
        &self,
        payload: SyncPayload,
        target: &str,
        callback: Arc<dyn DistroCallback>,
    ) -> Result<()>;

    /// Push a checksum digest and wait for the peer's answer
    async fn sync_verify_data(&self, payload: SyncPayload, target: &str) -> bool;

    /// Push a checksum digest without waiting
    async fn sync_verify_data_with_callback(
        &self,
        payload: SyncPayload,
        target: &str,
        callback: Arc<dyn DistroCallback>,
    ) -> Result<()>;

    /// Pull the resources named by `key` from `target`
    async fn get_data(&self, key: &SyncKey, target: &str) -> Result<SyncPayload>;

    /// Pull `target`'s whole store
    async fn get_snapshot(&self, target: &str) -> Result<SyncPayload>;
}

/// Check that pulled content holds datums before handing it on
fn checked_pull(codec: &DistroCodec, target: &str, payload: SyncPayload) -> Result<SyncPayload> {
    codec
        .decode::<BTreeMap<ResourceKey, Datum>>(&payload.content)
        .map_err(|e| Error::transport(target, format!("malformed reply: {}", e)))?;
    Ok(payload)
}
