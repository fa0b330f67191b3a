//! HTTP transport binding
//!
//! Each call is one request to the peer's HTTP API (`host:port + offset`).
//! Payload content travels as the raw encoded body; the payload's key and
//! operation travel in the query string.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{checked_pull, DistroCallback, DistroTransportAgent};
use crate::cluster::MemberSource;
use crate::config::http_address;
use crate::distro::codec::DistroCodec;
use crate::distro::data::{DataOperation, SyncKey, SyncPayload};
use crate::error::{Error, Result};

/// Query string of `PUT /distro/datum`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumPush {
    pub source: String,
    pub operation: DataOperation,
    /// JSON form of the payload's [`SyncKey`]
    pub key: String,
}

impl DatumPush {
    pub fn new(source: impl Into<String>, payload: &SyncPayload) -> Result<Self> {
        Ok(Self {
            source: source.into(),
            operation: payload.operation,
            key: serde_json::to_string(&payload.key)?,
        })
    }

    /// Decode the pushed payload's key
    pub fn sync_key(&self) -> Result<SyncKey> {
        Ok(serde_json::from_str(&self.key)?)
    }
}

/// Body of `POST /distro/datum/query`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatumQuery {
    pub keys: Vec<String>,
}

#[derive(Serialize)]
struct SourceParam<'a> {
    source: &'a str,
}

/// Blocking request/response transport over HTTP
pub struct HttpTransportAgent {
    local_address: String,
    members: Arc<dyn MemberSource>,
    client: reqwest::Client,
    codec: DistroCodec,
    http_port_offset: u16,
    sync_timeout: Duration,
    snapshot_timeout: Duration,
}

impl HttpTransportAgent {
    pub fn new(
        members: Arc<dyn MemberSource>,
        codec: DistroCodec,
        http_port_offset: u16,
        sync_timeout: Duration,
        snapshot_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(sync_timeout)
            .build()?;

        Ok(Self {
            local_address: members.local_address().to_string(),
            members,
            client,
            codec,
            http_port_offset,
            sync_timeout,
            snapshot_timeout,
        })
    }

    fn url(&self, target: &str, path: &str) -> Result<String> {
        let address = http_address(target, self.http_port_offset)
            .ok_or_else(|| Error::transport(target, "no HTTP address for member"))?;
        Ok(format!("http://{}{}", address, path))
    }

    async fn put(&self, target: &str, request: reqwest::RequestBuilder) -> bool {
        match request.send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                tracing::warn!("Distro push to {} rejected: {}", target, response.status());
                false
            }
            Err(e) => {
                tracing::warn!("Distro push to {} failed: {}", target, e);
                false
            }
        }
    }

    async fn fetch(&self, target: &str, request: reqwest::RequestBuilder) -> Result<Vec<u8>> {
        let response = request
            .send()
            .await
            .map_err(|e| Error::transport(target, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::transport(target, format!("peer answered {}", status)));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::transport(target, e))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl DistroTransportAgent for HttpTransportAgent {
    fn supports_callback_transport(&self) -> bool {
        false
    }

    async fn sync_data(&self, payload: SyncPayload, target: &str) -> bool {
        if !self.members.has_member(target).await {
            tracing::debug!("Skipping push of {} to former member {}", payload.key, target);
            return true;
        }

        let url = match self.url(target, "/distro/datum") {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("{}", e);
                return false;
            }
        };
        let params = match DatumPush::new(self.local_address.as_str(), &payload) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("Cannot describe push of {}: {}", payload.key, e);
                return false;
            }
        };

        let request = self
            .client
            .put(url)
            .query(&params)
            .timeout(self.sync_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.content);
        self.put(target, request).await
    }

    async fn sync_data_with_callback(
        &self,
        _payload: SyncPayload,
        _target: &str,
        _callback: Arc<dyn DistroCallback>,
    ) -> Result<()> {
        Err(Error::Unsupported(
            "HTTP transport does not support callback sync".into(),
        ))
    }

    async fn sync_verify_data(&self, payload: SyncPayload, target: &str) -> bool {
        if !self.members.has_member(target).await {
            return true;
        }

        let url = match self.url(target, "/distro/checksum") {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!("{}", e);
                return false;
            }
        };

        let request = self
            .client
            .put(url)
            .query(&SourceParam {
                source: &self.local_address,
            })
            .timeout(self.sync_timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(payload.content);
        self.put(target, request).await
    }

    async fn sync_verify_data_with_callback(
        &self,
        _payload: SyncPayload,
        _target: &str,
        _callback: Arc<dyn DistroCallback>,
    ) -> Result<()> {
        Err(Error::Unsupported(
            "HTTP transport does not support callback verify".into(),
        ))
    }

    async fn get_data(&self, key: &SyncKey, target: &str) -> Result<SyncPayload> {
        let url = self.url(target, "/distro/datum/query")?;
        let request = self
            .client
            .post(url)
            .timeout(self.sync_timeout)
            .json(&DatumQuery {
                keys: key.resource_keys(),
            });

        let content = self.fetch(target, request).await?;
        checked_pull(
            &self.codec,
            target,
            SyncPayload::new(key.clone(), content, DataOperation::Sync),
        )
    }

    async fn get_snapshot(&self, target: &str) -> Result<SyncPayload> {
        let url = self.url(target, "/distro/datums")?;
        let request = self.client.get(url).timeout(self.snapshot_timeout);

        let content = self.fetch(target, request).await?;
        checked_pull(
            &self.codec,
            target,
            SyncPayload::new(SyncKey::Snapshot, content, DataOperation::Snapshot),
        )
    }
}
