//! The QUIC server: authenticates each connection, then serves one request per stream.

use std::{io, net::SocketAddr, sync::Arc};

use alloy::primitives::Address;
use async_trait::async_trait;
use quinn::{
    crypto::rustls::{NoInitialCipherSuite, QuicServerConfig},
    rustls, ConnectionError, Endpoint, Incoming, RecvStream, SendStream, ServerConfig,
};
use serde::{de::DeserializeOwned, Serialize};
use terrors::OneOf;
use tokio::task::JoinHandle;
use tracing::{error, span, warn, Instrument, Level};

use crate::{
    framing::{read_frame, write_frame, FrameError},
    handshake::{reject, HandshakeAuthenticator},
};

/// Configuration for the QUIC server.
#[derive(Debug)]
pub struct Config {
    /// The address to bind the server to.
    pub addr: SocketAddr,

    /// The maximum number of concurrent connections allowed.
    pub connection_limit: Option<usize>,

    /// The TLS configuration for the server.
    pub tls_config: rustls::ServerConfig,
}

/// Answers requests from authenticated peers.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Request body.
    type Request: DeserializeOwned + Send + 'static;

    /// Response body.
    type Response: Serialize + Send + Sync + 'static;

    /// Handles one request from `peer`, the address proven in the handshake.
    async fn handle(&self, peer: Address, request: Self::Request) -> Self::Response;
}

/// Binds the QUIC endpoint.
pub fn bind(c: Config) -> Result<Endpoint, OneOf<(NoInitialCipherSuite, io::Error)>> {
    let quic_server_config = ServerConfig::with_crypto(Arc::new(
        QuicServerConfig::try_from(c.tls_config).map_err(OneOf::new)?,
    ));
    Endpoint::server(quic_server_config, c.addr).map_err(OneOf::new)
}

/// Binds the endpoint and serves `service` until the endpoint is closed.
pub async fn run_server<S: Service>(
    c: Config,
    auth: Arc<HandshakeAuthenticator>,
    service: Arc<S>,
) -> Result<(), OneOf<(NoInitialCipherSuite, io::Error)>> {
    let connection_limit = c.connection_limit;
    let endpoint = bind(c)?;
    serve(endpoint, connection_limit, auth, service).await;
    Ok(())
}

/// Accepts connections on an already bound endpoint.
pub async fn serve<S: Service>(
    endpoint: Endpoint,
    connection_limit: Option<usize>,
    auth: Arc<HandshakeAuthenticator>,
    service: Arc<S>,
) {
    while let Some(incoming) = endpoint.accept().await {
        let span = span!(Level::INFO,
            "connection",
            cid = %incoming.orig_dst_cid(),
            remote = %incoming.remote_address(),
            remote_validated = %incoming.remote_address_validated()
        );
        if matches!(connection_limit, Some(n) if endpoint.open_connections() >= n) {
            warn!(remote = %incoming.remote_address(), "connection limit reached, refusing");
            incoming.refuse();
        } else {
            tokio::spawn(conn_handler(incoming, auth.clone(), service.clone()).instrument(span));
        }
    }
}

/// Handles a single incoming connection.
async fn conn_handler<S: Service>(
    incoming: Incoming,
    auth: Arc<HandshakeAuthenticator>,
    service: Arc<S>,
) {
    let conn = match incoming.await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("accepting incoming conn failed: {e:?}");
            return;
        }
    };

    let peer = match auth.accept(&conn).await {
        Ok(peer) => peer,
        Err(e) => {
            reject(&conn, &e);
            return;
        }
    };

    let mut req_id: usize = 0;
    loop {
        let (tx, rx) = match conn.accept_bi().await {
            Ok(txers) => txers,
            Err(ConnectionError::ApplicationClosed(_)) => return,
            Err(e) => {
                warn!("accepting incoming stream failed: {e:?}");
                break;
            }
        };
        req_id = req_id.wrapping_add(1);
        let handler_span =
            span!(Level::INFO, "request handler", cid = %conn.stable_id(), %peer, rid = req_id);
        let manager_span =
            span!(Level::INFO, "request manager", cid = %conn.stable_id(), %peer, rid = req_id);
        tokio::spawn(
            request_manager::<S>(
                tx,
                tokio::spawn(
                    request_handler(rx, peer, service.clone()).instrument(handler_span),
                ),
            )
            .instrument(manager_span),
        );
    }
}

/// Writes the handler's response back on the stream.
async fn request_manager<S: Service>(
    mut tx: SendStream,
    handler: JoinHandle<Result<S::Response, FrameError>>,
) {
    let handler_res = match handler.await {
        Ok(r) => r,
        Err(e) => {
            error!("request handler failed: {e:?}");
            return;
        }
    };

    match handler_res {
        Ok(response) => {
            if let Err(e) = write_frame(&mut tx, &response).await {
                warn!("failed to send response: {e:?}");
                return;
            }
            let _ = tx.finish();
        }
        Err(e) => warn!("handler failed to read: {e:?}"),
    }
}

/// Reads one request and runs it through the service.
async fn request_handler<S: Service>(
    mut rx: RecvStream,
    peer: Address,
    service: Arc<S>,
) -> Result<S::Response, FrameError> {
    let request: S::Request = read_frame(&mut rx).await?;
    Ok(service.handle(peer, request).await)
}
