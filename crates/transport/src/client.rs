//! Connecting to a peer's QUIC server and making requests.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use alloy::primitives::Address;
use quinn::{
    crypto::rustls::QuicClientConfig, rustls, ClientConfig as QuinnClientConfig, Connection,
    ConnectionError, Endpoint,
};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use crate::{
    framing::{read_frame, write_frame, FrameError},
    handshake::{reject, HandshakeAuthenticator, HandshakeError},
};

/// Where and how to reach one peer.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// The peer's server address.
    pub server_addr: SocketAddr,
    /// Name the peer's certificate is issued for.
    pub server_hostname: String,
    /// Local address to bind, any by default.
    pub local_addr: Option<SocketAddr>,
    /// TLS client configuration.
    pub tls_config: rustls::ClientConfig,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Errors talking to a peer.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The local endpoint or the connection attempt could not be set up.
    #[error("connect: {0}")]
    Connect(String),

    /// The connection failed or was closed.
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    /// The peer failed authentication.
    #[error("handshake: {0}")]
    Handshake(#[from] HandshakeError),

    /// A request or response could not be exchanged.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,
}

/// An authenticated connection to one peer.
#[derive(Debug, Clone)]
pub struct TransportClient {
    endpoint: Endpoint,
    config: Arc<ClientConfig>,
    conn: Connection,
    peer: Address,
}

impl TransportClient {
    /// Connects to the peer and runs the handshake.
    pub async fn connect(
        config: ClientConfig,
        auth: &HandshakeAuthenticator,
    ) -> Result<Self, ClientError> {
        let endpoint = Endpoint::client(
            config
                .local_addr
                .unwrap_or((Ipv4Addr::UNSPECIFIED, 0).into()),
        )
        .map_err(|e| ClientError::Connect(e.to_string()))?;

        let quic_config = QuicClientConfig::try_from(config.tls_config.clone())
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let connecting = endpoint
            .connect_with(
                QuinnClientConfig::new(Arc::new(quic_config)),
                config.server_addr,
                &config.server_hostname,
            )
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let conn = timeout(config.timeout, connecting)
            .await
            .map_err(|_| ClientError::Timeout)??;

        let peer = match auth.initiate(&conn).await {
            Ok(peer) => peer,
            Err(e) => {
                reject(&conn, &e);
                return Err(e.into());
            }
        };
        debug!(%peer, addr = %config.server_addr, "connected to peer");

        Ok(Self {
            endpoint,
            config: Arc::new(config),
            conn,
            peer,
        })
    }

    /// The peer's federator address, as proven in the handshake.
    pub const fn peer(&self) -> Address {
        self.peer
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }

    /// Sends `request` on a new stream and waits for the response.
    pub async fn request<Req, Resp>(&self, request: &Req) -> Result<Resp, ClientError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        timeout(self.config.timeout, async {
            let (mut tx, mut rx) = self.conn.open_bi().await?;
            write_frame(&mut tx, request).await?;
            let _ = tx.finish();
            Ok::<_, ClientError>(read_frame(&mut rx).await?)
        })
        .await
        .map_err(|_| ClientError::Timeout)?
    }

    /// Closes the connection and waits for the endpoint to go idle.
    pub async fn close(self) {
        self.conn.close(0u32.into(), b"bye");
        self.endpoint.wait_idle().await;
    }
}
