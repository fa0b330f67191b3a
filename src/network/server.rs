//! Network Server
//!
//! TCP server answering cluster clients. Handshakes and heartbeats are
//! answered here; everything else goes to the registered [`RequestHandler`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{read_message, write_message, ErrorCode, Message};
use crate::error::{Error, Result};

/// Handles requests arriving over the cluster RPC channel
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Produce the response for one request from `peer`
    async fn handle(&self, peer: &str, message: Message) -> Message;
}

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Member address reported in handshakes
    advertise_address: String,
    /// Request handler
    handler: Arc<dyn RequestHandler>,
    /// Shutdown signal
    shutdown: tokio::sync::watch::Sender<bool>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(
        bind_address: String,
        advertise_address: String,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);

        Self {
            bind_address,
            advertise_address,
            handler,
            shutdown: shutdown_tx,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Cluster RPC server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);
                            let advertise = self.advertise_address.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, peer_addr.clone(), advertise, handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Cluster RPC server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Handle a single connection
async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    advertise_address: String,
    handler: Arc<dyn RequestHandler>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);

                let response = match message {
                    Message::ServerCheck { connection_id } => {
                        tracing::debug!("Cluster client {} connected from {}", connection_id, peer_addr);
                        Message::ServerCheckResponse {
                            address: advertise_address.clone(),
                        }
                    }
                    Message::HeartBeat { .. } => Message::HeartBeatResponse,
                    Message::DistroData { .. }
                    | Message::DistroQuery { .. }
                    | Message::DistroSnapshot => handler.handle(&peer_addr, message).await,
                    other => Message::Error {
                        code: ErrorCode::Unsupported,
                        message: format!("Unexpected request {}", other.type_name()),
                    },
                };

                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
