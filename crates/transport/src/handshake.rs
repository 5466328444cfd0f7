//! Challenge-response authentication on top of TLS.
//!
//! Both ends export the same 32 bytes of keying material from the TLS session and sign them,
//! together with a timestamp, with their federator key (EIP-191). A challenge is only valid on
//! the session it was made for, only for a short time, and only from a current federator.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use alloy::{
    primitives::{Address, Signature},
    signers::{local::PrivateKeySigner, SignerSync},
};
use quinn::{Connection, ConnectionError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    federators::FederatorSource,
    framing::{read_frame, write_frame, FrameError},
};

/// Exporter label of the channel binding.
pub const HANDSHAKE_LABEL: &[u8] = b"federator-handshake";

/// Length of the channel binding.
pub const BINDING_LEN: usize = 32;

/// Largest accepted distance between a challenge timestamp and our clock.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Timeout for handshake I/O.
pub const COMM_TIMEOUT: Duration = Duration::from_secs(3);

/// Application error code used when closing a connection after a failed handshake.
pub const HANDSHAKE_FAILED_CODE: u32 = 0x01;

/// Why a handshake failed.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// No keying material could be exported from the session.
    #[error("could not export channel binding")]
    Binding,

    /// The challenge is for a different session.
    #[error("challenge is bound to a different session")]
    WrongBinding,

    /// The challenge is older than [`MAX_CLOCK_SKEW`].
    #[error("challenge is stale by {0}s")]
    Stale(u64),

    /// The challenge claims to be from more than [`MAX_CLOCK_SKEW`] in the future.
    #[error("challenge is {0}s in the future")]
    FromFuture(u64),

    /// The signature is malformed or does not recover.
    #[error("bad signature: {0}")]
    BadSignature(String),

    /// The signer is not a current federator.
    #[error("{0} is not a federator")]
    UnknownSigner(Address),

    /// We could not sign our own challenge.
    #[error("signing failed: {0}")]
    Signing(String),

    /// The federator set could not be fetched.
    #[error(transparent)]
    FederatorLookup(#[from] crate::federators::FederatorLookupError),

    /// The handshake stream could not be opened or accepted.
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),

    /// A handshake message could not be exchanged.
    #[error("frame: {0}")]
    Frame(#[from] FrameError),

    /// The handshake did not finish within [`COMM_TIMEOUT`].
    #[error("handshake timed out")]
    Timeout,
}

/// One side's proof of identity for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeChallenge {
    /// Hex of the exported channel binding.
    pub binding: String,
    /// Unix seconds at creation.
    pub timestamp: u64,
    /// Hex of the 65-byte EIP-191 signature over `binding || timestamp_be`.
    pub signature: String,
}

fn signed_message(binding: &[u8], timestamp: u64) -> Vec<u8> {
    let mut msg = Vec::with_capacity(binding.len() + 8);
    msg.extend_from_slice(binding);
    msg.extend_from_slice(&timestamp.to_be_bytes());
    msg
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl HandshakeChallenge {
    /// Signs `binding` at `timestamp`.
    pub fn new(
        signer: &PrivateKeySigner,
        binding: &[u8],
        timestamp: u64,
    ) -> Result<Self, HandshakeError> {
        let signature = signer
            .sign_message_sync(&signed_message(binding, timestamp))
            .map_err(|e| HandshakeError::Signing(e.to_string()))?;
        Ok(Self {
            binding: hex::encode(binding),
            timestamp,
            signature: hex::encode(signature.as_bytes()),
        })
    }

    /// Checks the challenge against our binding, clock and federator set, in that order, and
    /// returns the signer.
    pub fn verify(
        &self,
        expected_binding: &[u8],
        now: u64,
        federators: &[Address],
    ) -> Result<Address, HandshakeError> {
        let binding = hex::decode(&self.binding).map_err(|_| HandshakeError::WrongBinding)?;
        if binding != expected_binding {
            return Err(HandshakeError::WrongBinding);
        }

        if now > self.timestamp && now - self.timestamp > MAX_CLOCK_SKEW.as_secs() {
            return Err(HandshakeError::Stale(now - self.timestamp));
        }
        if self.timestamp > now && self.timestamp - now > MAX_CLOCK_SKEW.as_secs() {
            return Err(HandshakeError::FromFuture(self.timestamp - now));
        }

        let raw = hex::decode(&self.signature)
            .map_err(|e| HandshakeError::BadSignature(e.to_string()))?;
        let signature =
            Signature::from_raw(&raw).map_err(|e| HandshakeError::BadSignature(e.to_string()))?;
        let signer = signature
            .recover_address_from_msg(signed_message(&binding, self.timestamp))
            .map_err(|e| HandshakeError::BadSignature(e.to_string()))?;

        if !federators.contains(&signer) {
            return Err(HandshakeError::UnknownSigner(signer));
        }
        Ok(signer)
    }
}

/// The channel binding of `conn`.
pub fn export_binding(conn: &Connection) -> Result<[u8; BINDING_LEN], HandshakeError> {
    let mut binding = [0u8; BINDING_LEN];
    conn.export_keying_material(&mut binding, HANDSHAKE_LABEL, b"")
        .map_err(|_| HandshakeError::Binding)?;
    Ok(binding)
}

/// Runs either side of the handshake with our key and the federator set.
#[derive(Debug, Clone)]
pub struct HandshakeAuthenticator {
    signer: PrivateKeySigner,
    federators: Arc<dyn FederatorSource>,
}

impl HandshakeAuthenticator {
    /// Creates an authenticator.
    pub fn new(signer: PrivateKeySigner, federators: Arc<dyn FederatorSource>) -> Self {
        Self { signer, federators }
    }

    /// Our federator address.
    pub fn address(&self) -> Address {
        self.signer.address()
    }

    async fn verify(
        &self,
        challenge: &HandshakeChallenge,
        binding: &[u8],
    ) -> Result<Address, HandshakeError> {
        let federators = self.federators.federators().await?;
        challenge.verify(binding, unix_now(), &federators)
    }

    /// Server side: waits for the client's challenge, verifies it and answers with ours.
    /// Returns the client's address.
    pub async fn accept(&self, conn: &Connection) -> Result<Address, HandshakeError> {
        timeout(COMM_TIMEOUT, async {
            let binding = export_binding(conn)?;
            let (mut tx, mut rx) = conn.accept_bi().await?;
            let theirs: HandshakeChallenge = read_frame(&mut rx).await?;
            let peer = self.verify(&theirs, &binding).await?;

            let ours = HandshakeChallenge::new(&self.signer, &binding, unix_now())?;
            write_frame(&mut tx, &ours).await?;
            let _ = tx.finish();
            debug!(%peer, "accepted peer handshake");
            Ok::<_, HandshakeError>(peer)
        })
        .await
        .map_err(|_| HandshakeError::Timeout)?
    }

    /// Client side: sends our challenge and verifies the server's answer.
    /// Returns the server's address.
    pub async fn initiate(&self, conn: &Connection) -> Result<Address, HandshakeError> {
        timeout(COMM_TIMEOUT, async {
            let binding = export_binding(conn)?;
            let (mut tx, mut rx) = conn.open_bi().await?;
            let ours = HandshakeChallenge::new(&self.signer, &binding, unix_now())?;
            write_frame(&mut tx, &ours).await?;
            let _ = tx.finish();

            let theirs: HandshakeChallenge = read_frame(&mut rx).await?;
            let peer = self.verify(&theirs, &binding).await?;
            debug!(%peer, "completed peer handshake");
            Ok::<_, HandshakeError>(peer)
        })
        .await
        .map_err(|_| HandshakeError::Timeout)?
    }
}

/// Closes `conn` after a failed handshake.
pub(crate) fn reject(conn: &Connection, error: &HandshakeError) {
    warn!(%error, remote = %conn.remote_address(), "handshake failed");
    conn.close(HANDSHAKE_FAILED_CODE.into(), error.to_string().as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const BINDING: [u8; BINDING_LEN] = [7; BINDING_LEN];
    const NOW: u64 = 1_700_000_000;

    fn signer() -> PrivateKeySigner {
        PrivateKeySigner::random()
    }

    #[test]
    fn accepts_fresh_federator_challenge() {
        let signer = signer();
        let challenge = HandshakeChallenge::new(&signer, &BINDING, NOW).unwrap();
        let peer = challenge
            .verify(&BINDING, NOW + 5, &[signer.address()])
            .unwrap();
        assert_eq!(peer, signer.address());
    }

    #[test]
    fn rejects_other_session() {
        let signer = signer();
        let challenge = HandshakeChallenge::new(&signer, &BINDING, NOW).unwrap();
        let err = challenge
            .verify(&[8; BINDING_LEN], NOW, &[signer.address()])
            .unwrap_err();
        assert!(matches!(err, HandshakeError::WrongBinding));
    }

    #[test]
    fn rejects_stale_and_future_timestamps() {
        let signer = signer();
        let federators = [signer.address()];

        let old = HandshakeChallenge::new(&signer, &BINDING, NOW - 61).unwrap();
        assert!(matches!(
            old.verify(&BINDING, NOW, &federators),
            Err(HandshakeError::Stale(61))
        ));

        let future = HandshakeChallenge::new(&signer, &BINDING, NOW + 61).unwrap();
        assert!(matches!(
            future.verify(&BINDING, NOW, &federators),
            Err(HandshakeError::FromFuture(61))
        ));

        let edge = HandshakeChallenge::new(&signer, &BINDING, NOW - 60).unwrap();
        assert!(edge.verify(&BINDING, NOW, &federators).is_ok());
    }

    #[test]
    fn rejects_non_federator() {
        let signer = signer();
        let challenge = HandshakeChallenge::new(&signer, &BINDING, NOW).unwrap();
        let err = challenge
            .verify(&BINDING, NOW, &[Address::repeat_byte(1)])
            .unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownSigner(a) if a == signer.address()));
    }

    #[test]
    fn rejects_tampered_timestamp() {
        let signer = signer();
        let mut challenge = HandshakeChallenge::new(&signer, &BINDING, NOW).unwrap();
        challenge.timestamp += 1;
        // recovers to some other address
        let err = challenge
            .verify(&BINDING, NOW, &[signer.address()])
            .unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::UnknownSigner(_) | HandshakeError::BadSignature(_)
        ));
    }
}
