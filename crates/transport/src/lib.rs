//! Authenticated peer transport: QUIC with mutual TLS, plus a challenge-response handshake that
//! binds each connection to a federator's EVM identity.
//!
//! Every request travels on its own bidirectional stream as a little-endian `u32` length prefix
//! followed by a JSON body.

pub mod client;
pub mod federators;
pub mod framing;
pub mod handshake;
pub mod server;
pub mod tls;

#[cfg(test)]
mod tests;

pub use client::{ClientConfig, ClientError, TransportClient};
pub use federators::{CachedFederators, FederatorLookupError, FederatorSource, StaticFederators};
pub use handshake::{HandshakeAuthenticator, HandshakeChallenge, HandshakeError, COMM_TIMEOUT};
pub use quinn::{rustls, Endpoint};
pub use server::{run_server, Config as ServerConfig, Service};
