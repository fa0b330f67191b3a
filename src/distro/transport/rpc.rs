//! RPC transport binding
//!
//! Sends Distro messages through the long-lived cluster clients. A target
//! that is a member but not `Up`, or whose client is not running, is a
//! failure; callback operations run on a spawned task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{checked_pull, DistroCallback, DistroTransportAgent};
use crate::cluster::{ClusterConnectionManager, MemberSource};
use crate::distro::codec::DistroCodec;
use crate::distro::data::{SyncKey, SyncPayload};
use crate::error::{Error, Result};
use crate::network::Message;

enum TargetState {
    /// No longer a member
    Departed,
    /// Member that cannot be reached right now
    Unavailable(String),
    Ready,
}

/// Callback-capable transport over the cluster connection manager
pub struct RpcTransportAgent {
    members: Arc<dyn MemberSource>,
    connections: Arc<ClusterConnectionManager>,
    codec: DistroCodec,
    sync_timeout: Duration,
    snapshot_timeout: Duration,
}

impl RpcTransportAgent {
    pub fn new(
        members: Arc<dyn MemberSource>,
        connections: Arc<ClusterConnectionManager>,
        codec: DistroCodec,
        sync_timeout: Duration,
        snapshot_timeout: Duration,
    ) -> Self {
        Self {
            members,
            connections,
            codec,
            sync_timeout,
            snapshot_timeout,
        }
    }

    async fn check_target(&self, target: &str) -> TargetState {
        let member = match self.members.find(target).await {
            Some(member) => member,
            None => return TargetState::Departed,
        };
        if !member.is_up() {
            return TargetState::Unavailable(format!("member is {}", member.state));
        }
        if !self.connections.is_running(target).await {
            return TargetState::Unavailable("cluster client not running".into());
        }
        TargetState::Ready
    }

    fn data_message(&self, payload: SyncPayload) -> Message {
        Message::DistroData {
            source: self.members.local_address().to_string(),
            payload,
        }
    }

    /// Push and wait; `true` only for an explicit success reply
    async fn push(&self, payload: SyncPayload, target: &str) -> bool {
        match self.check_target(target).await {
            TargetState::Departed => return true,
            TargetState::Unavailable(reason) => {
                tracing::debug!("Distro push of {} to {} skipped: {}", payload.key, target, reason);
                return false;
            }
            TargetState::Ready => {}
        }

        let key = payload.key.clone();
        let request = self.data_message(payload);
        match self
            .connections
            .send_request(target, request, self.sync_timeout)
            .await
        {
            Ok(Message::DistroResponse { success: true, .. }) => true,
            Ok(reply) => {
                tracing::warn!("Distro push of {} to {} rejected: {}", key, target, reply_reason(&reply));
                false
            }
            Err(e) => {
                tracing::warn!("Distro push of {} to {} failed: {}", key, target, e);
                false
            }
        }
    }

    /// Push on a spawned task and report through `callback`
    async fn push_with_callback(
        &self,
        payload: SyncPayload,
        target: &str,
        callback: Arc<dyn DistroCallback>,
    ) -> Result<()> {
        match self.check_target(target).await {
            TargetState::Departed => {
                callback.on_success();
                return Ok(());
            }
            TargetState::Unavailable(_) => {
                callback.on_failed(None);
                return Ok(());
            }
            TargetState::Ready => {}
        }

        let request = self.data_message(payload);
        let connections = Arc::clone(&self.connections);
        let target = target.to_string();
        let timeout = self.sync_timeout;

        tokio::spawn(async move {
            match connections.send_request(&target, request, timeout).await {
                Ok(Message::DistroResponse { success: true, .. }) => callback.on_success(),
                Ok(_) => callback.on_failed(None),
                Err(e) => callback.on_failed(Some(e)),
            }
        });
        Ok(())
    }

    /// Request/response pull returning the reply payload
    async fn pull(&self, request: Message, target: &str, timeout: Duration) -> Result<SyncPayload> {
        match self.check_target(target).await {
            TargetState::Departed => return Err(Error::transport(target, "not a cluster member")),
            TargetState::Unavailable(reason) => return Err(Error::transport(target, reason)),
            TargetState::Ready => {}
        }

        let reply = self
            .connections
            .send_request(target, request, timeout)
            .await
            .map_err(|e| Error::transport(target, e))?;

        match reply {
            Message::DistroResponse {
                success: true,
                payload: Some(payload),
                ..
            } => checked_pull(&self.codec, target, payload),
            other => Err(Error::transport(target, reply_reason(&other))),
        }
    }
}

fn reply_reason(reply: &Message) -> String {
    match reply {
        Message::DistroResponse {
            message: Some(message),
            ..
        } => message.clone(),
        Message::DistroResponse { payload: None, success: true, .. } => "empty reply".into(),
        Message::Error { message, .. } => message.clone(),
        other => format!("unexpected reply {}", other.type_name()),
    }
}

#[async_trait]
impl DistroTransportAgent for RpcTransportAgent {
    fn supports_callback_transport(&self) -> bool {
        true
    }

    async fn sync_data(&self, payload: SyncPayload, target: &str) -> bool {
        self.push(payload, target).await
    }

    async fn sync_data_with_callback(
        &self,
        payload: SyncPayload,
        target: &str,
        callback: Arc<dyn DistroCallback>,
    ) -> Result<()> {
        self.push_with_callback(payload, target, callback).await
    }

    async fn sync_verify_data(&self, payload: SyncPayload, target: &str) -> bool {
        self.push(payload, target).await
    }

    async fn sync_verify_data_with_callback(
        &self,
        payload: SyncPayload,
        target: &str,
        callback: Arc<dyn DistroCallback>,
    ) -> Result<()> {
        self.push_with_callback(payload, target, callback).await
    }

    async fn get_data(&self, key: &SyncKey, target: &str) -> Result<SyncPayload> {
        let request = Message::DistroQuery { key: key.clone() };
        self.pull(request, target, self.sync_timeout).await
    }

    async fn get_snapshot(&self, target: &str) -> Result<SyncPayload> {
        self.pull(Message::DistroSnapshot, target, self.snapshot_timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClientOptions, ClusterMembership, MemberState};
    use crate::distro::data::DataOperation;
    use crate::distro::transport::testing::RecordingCallback;
    use crate::network::{NetworkServer, RequestHandler};
    use crate::store::Datum;
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    const LOCAL: &str = "127.0.0.1:1";

    /// Accepts pushes for `svc:ok` only, serves an empty snapshot and answers
    /// queries for `svc:garbage` with undecodable content
    struct PeerHandler;

    #[async_trait]
    impl RequestHandler for PeerHandler {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::DistroData { payload, .. } => {
                    if payload.key == SyncKey::Single("svc:ok".into()) {
                        Message::ok(None)
                    } else {
                        Message::failed("rejected")
                    }
                }
                Message::DistroSnapshot => {
                    let empty = DistroCodec::default()
                        .encode(&BTreeMap::<String, Datum>::new())
                        .unwrap();
                    Message::ok(Some(SyncPayload::new(
                        SyncKey::Snapshot,
                        empty,
                        DataOperation::Snapshot,
                    )))
                }
                Message::DistroQuery { key } if key == SyncKey::Single("svc:garbage".into()) => {
                    Message::ok(Some(SyncPayload::new(key, vec![0xff, 0x01], DataOperation::Sync)))
                }
                _ => Message::failed("unsupported"),
            }
        }
    }

    fn options() -> ClientOptions {
        ClientOptions {
            connect_timeout: Duration::from_millis(200),
            beat_interval: Duration::from_secs(5),
            reconnect_interval: Duration::from_millis(50),
        }
    }

    fn push(key: &str) -> SyncPayload {
        SyncPayload::new(SyncKey::Single(key.into()), Vec::new(), DataOperation::Sync)
    }

    struct Fixture {
        agent: RpcTransportAgent,
        membership: Arc<ClusterMembership>,
        connections: Arc<ClusterConnectionManager>,
        peer: String,
        server: Arc<NetworkServer>,
    }

    async fn fixture() -> Fixture {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = listener.local_addr().unwrap().to_string();
        let server = Arc::new(NetworkServer::new(peer.clone(), peer.clone(), Arc::new(PeerHandler)));
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        let membership = Arc::new(ClusterMembership::new(LOCAL.into(), vec![peer.clone()]));
        let connections = Arc::new(ClusterConnectionManager::new(LOCAL.into(), options()));
        connections.init(&membership.all_members().await).await;

        let agent = RpcTransportAgent::new(
            membership.clone(),
            connections.clone(),
            DistroCodec::default(),
            Duration::from_secs(1),
            Duration::from_secs(2),
        );
        Fixture {
            agent,
            membership,
            connections,
            peer,
            server,
        }
    }

    impl Fixture {
        async fn close(self) {
            self.connections.shutdown_all().await;
            self.server.stop();
        }
    }

    #[tokio::test]
    async fn test_sync_data_follows_reply() {
        let f = fixture().await;
        assert!(f.agent.supports_callback_transport());
        assert!(f.agent.sync_data(push("svc:ok"), &f.peer).await);
        assert!(!f.agent.sync_data(push("svc:bad"), &f.peer).await);
        assert!(f.agent.sync_verify_data(push("svc:ok"), &f.peer).await);
        f.close().await;
    }

    #[tokio::test]
    async fn test_departed_member_is_silent_success() {
        let f = fixture().await;
        assert!(f.agent.sync_data(push("svc:bad"), "127.0.0.1:9").await);

        let callback = Arc::new(RecordingCallback::default());
        f.agent
            .sync_data_with_callback(push("svc:bad"), "127.0.0.1:9", callback.clone())
            .await
            .unwrap();
        assert_eq!(callback.successes(), 1);
        f.close().await;
    }

    #[tokio::test]
    async fn test_member_not_up_fails() {
        let f = fixture().await;
        f.membership.set_state(&f.peer, MemberState::Down).await;

        assert!(!f.agent.sync_data(push("svc:ok"), &f.peer).await);
        let callback = Arc::new(RecordingCallback::default());
        f.agent
            .sync_verify_data_with_callback(push("svc:ok"), &f.peer, callback.clone())
            .await
            .unwrap();
        assert_eq!(callback.failures(), 1);
        assert!(matches!(
            f.agent.get_snapshot(&f.peer).await,
            Err(Error::Transport { .. })
        ));
        f.close().await;
    }

    #[tokio::test]
    async fn test_callback_reports_outcome() {
        let f = fixture().await;

        let callback = Arc::new(RecordingCallback::default());
        f.agent
            .sync_data_with_callback(push("svc:ok"), &f.peer, callback.clone())
            .await
            .unwrap();
        callback.notify.notified().await;
        assert_eq!(callback.successes(), 1);

        let callback = Arc::new(RecordingCallback::default());
        f.agent
            .sync_data_with_callback(push("svc:bad"), &f.peer, callback.clone())
            .await
            .unwrap();
        callback.notify.notified().await;
        assert_eq!(callback.failures(), 1);
        f.close().await;
    }

    #[tokio::test]
    async fn test_pulls() {
        let f = fixture().await;

        let snapshot = f.agent.get_snapshot(&f.peer).await.unwrap();
        assert_eq!(snapshot.key, SyncKey::Snapshot);

        let result = f.agent.get_data(&SyncKey::Single("svc:A".into()), &f.peer).await;
        assert!(matches!(result, Err(Error::Transport { .. })));

        let result = f.agent.get_data(&SyncKey::Single("svc:A".into()), "127.0.0.1:9").await;
        assert!(matches!(result, Err(Error::Transport { .. })));

        let result = f
            .agent
            .get_data(&SyncKey::Single("svc:garbage".into()), &f.peer)
            .await;
        match result {
            Err(e @ Error::Transport { .. }) => assert!(e.is_retryable()),
            other => panic!("expected transport fault, got {:?}", other),
        }
        f.close().await;
    }
}
