//! Errors of the peer network.

use federator_transport::ClientError;
use thiserror::Error;

use crate::messages::{NodeId, Topic};

/// Errors from network operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// A handler is already registered for the topic.
    #[error("a handler for {0} is already registered")]
    DuplicateHandler(Topic),

    /// The node is not one of our peers.
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),

    /// The local server could not be started.
    #[error("bind: {0}")]
    Bind(String),

    /// The peer's address could not be resolved.
    #[error("could not resolve {0}")]
    Resolve(String),

    /// Talking to the peer failed.
    #[error("transport: {0}")]
    Transport(#[from] ClientError),

    /// The peer sent something other than what was asked for.
    #[error("unexpected response from {0}")]
    UnexpectedResponse(NodeId),

    /// A payload could not be encoded or decoded.
    #[error("payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A question handler refused or failed to answer.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct AnswerError(pub String);

impl AnswerError {
    /// Wraps any displayable error.
    pub fn new(e: impl std::fmt::Display) -> Self {
        Self(e.to_string())
    }
}
