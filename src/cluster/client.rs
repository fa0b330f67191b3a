//! Cluster Client
//!
//! One long-lived TCP connection to a peer's cluster RPC server.
//!
//! Lifecycle: `WaitInit -> Inited -> Starting -> Running`. [`ClusterClient::init`]
//! assigns a connection id and a target, [`ClusterClient::start`] connects and
//! performs the `ServerCheck` handshake. A failed start or a broken connection
//! re-enters `Starting` and a background task reconnects every
//! `reconnect_interval` until the client is running again.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::network::{read_message, write_message, Message};

/// Connection status of a cluster client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientStatus {
    /// No target assigned yet
    WaitInit = 0,
    /// Target assigned, never started
    Inited = 1,
    /// Connecting or reconnecting
    Starting = 2,
    /// Connected and handshaken
    Running = 3,
}

impl ClientStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ClientStatus::Inited,
            2 => ClientStatus::Starting,
            3 => ClientStatus::Running,
            _ => ClientStatus::WaitInit,
        }
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::WaitInit => write!(f, "WAIT_INIT"),
            ClientStatus::Inited => write!(f, "INITED"),
            ClientStatus::Starting => write!(f, "STARTING"),
            ClientStatus::Running => write!(f, "RUNNING"),
        }
    }
}

/// Timing options for cluster clients
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Connect and handshake timeout
    pub connect_timeout: Duration,
    /// Interval between heartbeats on a running connection
    pub beat_interval: Duration,
    /// Delay between reconnect attempts
    pub reconnect_interval: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            beat_interval: Duration::from_secs(3),
            reconnect_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct ClientIdentity {
    connection_id: String,
    target: String,
}

/// Long-lived client for one cluster peer
pub struct ClusterClient {
    identity: OnceLock<ClientIdentity>,
    status: AtomicU8,
    connection: Mutex<Option<TcpStream>>,
    switching: AtomicBool,
    beating: AtomicBool,
    shutdown: AtomicBool,
    options: ClientOptions,
}

impl ClusterClient {
    /// Create a client in `WaitInit`
    pub fn new(options: ClientOptions) -> Self {
        Self {
            identity: OnceLock::new(),
            status: AtomicU8::new(ClientStatus::WaitInit as u8),
            connection: Mutex::new(None),
            switching: AtomicBool::new(false),
            beating: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            options,
        }
    }

    /// Assign a connection id and target; `WaitInit -> Inited`
    pub fn init(&self, target: &str) {
        let identity = ClientIdentity {
            connection_id: uuid::Uuid::new_v4().to_string(),
            target: target.to_string(),
        };
        if self.identity.set(identity).is_err() {
            tracing::warn!("Cluster client for {} already initialized", target);
            return;
        }
        self.set_status(ClientStatus::Inited);
    }

    /// Current status
    pub fn status(&self) -> ClientStatus {
        ClientStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.status() == ClientStatus::Running
    }

    /// Peer address, once initialized
    pub fn target(&self) -> Option<&str> {
        self.identity.get().map(|i| i.target.as_str())
    }

    /// Connection id, once initialized
    pub fn connection_id(&self) -> Option<&str> {
        self.identity.get().map(|i| i.connection_id.as_str())
    }

    fn set_status(&self, status: ClientStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    fn identity(&self) -> Result<&ClientIdentity> {
        self.identity
            .get()
            .ok_or_else(|| Error::ClientNotInitialized("no target assigned".into()))
    }

    /// Connect to the target; `Inited -> Starting -> Running`.
    ///
    /// On failure the client stays in `Starting` with a reconnect loop running
    /// and the error is returned.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let identity = self.identity()?;
        match self.status() {
            ClientStatus::WaitInit => {
                return Err(Error::ClientNotInitialized(identity.target.clone()));
            }
            ClientStatus::Running | ClientStatus::Starting => return Ok(()),
            ClientStatus::Inited => {}
        }

        self.set_status(ClientStatus::Starting);
        self.spawn_beat_loop();

        match self.connect_to_server().await {
            Ok(stream) => {
                *self.connection.lock().await = Some(stream);
                self.set_status(ClientStatus::Running);
                tracing::info!(
                    "Cluster client {} connected to {}",
                    identity.connection_id,
                    identity.target
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Cluster client to {} failed to start: {}", identity.target, e);
                self.switch_server();
                Err(e)
            }
        }
    }

    /// Open a connection and perform the handshake
    async fn connect_to_server(&self) -> Result<TcpStream> {
        let identity = self.identity()?;
        let address = identity.target.as_str();

        let handshake = async {
            let mut stream = TcpStream::connect(address).await.map_err(|e| {
                Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                }
            })?;
            stream.set_nodelay(true)?;

            let check = Message::ServerCheck {
                connection_id: identity.connection_id.clone(),
            };
            write_message(&mut stream, &check).await?;
            match read_message(&mut stream).await? {
                Message::ServerCheckResponse { .. } => Ok::<TcpStream, Error>(stream),
                other => Err(Error::ConnectionFailed {
                    address: address.to_string(),
                    reason: format!("unexpected handshake reply {}", other.type_name()),
                }),
            }
        };

        match timeout(self.options.connect_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Enter `Starting` and reconnect in the background until running
    pub fn switch_server(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        self.set_status(ClientStatus::Starting);
        if self.switching.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while !client.is_running() && !client.shutdown.load(Ordering::SeqCst) {
                match client.connect_to_server().await {
                    Ok(stream) => {
                        *client.connection.lock().await = Some(stream);
                        client.set_status(ClientStatus::Running);
                        tracing::info!(
                            "Cluster client reconnected to {}",
                            client.target().unwrap_or_default()
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            "Reconnect to {} failed: {}",
                            client.target().unwrap_or_default(),
                            e
                        );
                        tokio::time::sleep(with_jitter(client.options.reconnect_interval)).await;
                    }
                }
            }
            client.switching.store(false, Ordering::SeqCst);
        });
    }

    fn spawn_beat_loop(self: &Arc<Self>) {
        if self.beating.swap(true, Ordering::SeqCst) {
            return;
        }

        let client = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.options.beat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if !client.is_running() {
                    continue;
                }
                let beat = Message::HeartBeat {
                    connection_id: client.connection_id().unwrap_or_default().to_string(),
                };
                if let Err(e) = client.request(beat, client.options.connect_timeout).await {
                    tracing::warn!(
                        "Heartbeat to {} failed, switching server: {}",
                        client.target().unwrap_or_default(),
                        e
                    );
                }
            }
        });
    }

    /// Send a request and wait for its response.
    ///
    /// `limit` covers waiting for the connection as well as the exchange. A
    /// write/read failure or timeout drops the connection and starts
    /// reconnecting; a request that never got the connection leaves it alone.
    pub async fn request(self: &Arc<Self>, message: Message, limit: Duration) -> Result<Message> {
        let target = self.identity()?.target.clone();
        if !self.is_running() {
            return Err(Error::ConnectionFailed {
                address: target,
                reason: format!("client is {}", self.status()),
            });
        }

        let started = tokio::time::Instant::now();
        let mut connection = match timeout(limit, self.connection.lock()).await {
            Ok(connection) => connection,
            Err(_) => {
                tracing::debug!("Connection to {} busy for {:?}", target, limit);
                return Err(Error::ConnectionTimeout(target));
            }
        };
        let remaining = limit.saturating_sub(started.elapsed());

        let stream = match connection.as_mut() {
            Some(stream) => stream,
            None => {
                return Err(Error::ConnectionFailed {
                    address: target,
                    reason: "no connection".into(),
                })
            }
        };

        let exchange = async {
            write_message(&mut *stream, &message).await?;
            read_message(&mut *stream).await
        };

        let result = match timeout(remaining, exchange).await {
            Ok(inner) => inner,
            Err(_) => Err(Error::ConnectionTimeout(target.clone())),
        };

        if result.is_err() {
            *connection = None;
            drop(connection);
            self.switch_server();
        }
        result
    }

    /// Stop reconnecting and close the connection
    pub async fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        *self.connection.lock().await = None;
        self.set_status(ClientStatus::WaitInit);
    }
}

/// Spread reconnect attempts of many clients by up to a tenth of `interval`
fn with_jitter(interval: Duration) -> Duration {
    use rand::Rng;

    let spread = interval.as_millis() as u64 / 10;
    if spread == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
