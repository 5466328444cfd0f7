//! The peer network seam.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    dispatch::{MessageListener, QuestionHandler},
    errors::NetworkError,
    messages::{Answer, Message, NodeId, Question, Topic},
};

/// Peer-to-peer messaging among a static set of federators.
#[async_trait]
pub trait Network: Send + Sync + fmt::Debug {
    /// This node's id.
    fn node_id(&self) -> &NodeId;

    /// The configured leader's id.
    fn leader_id(&self) -> &NodeId;

    /// Whether this node is the leader.
    fn is_leader(&self) -> bool {
        self.node_id() == self.leader_id()
    }

    /// Sends `msg` to every peer. Per-peer failures are logged.
    async fn broadcast(&self, msg: Message);

    /// Sends `msg` to one peer.
    async fn send(&self, to: &NodeId, msg: Message) -> Result<(), NetworkError>;

    /// Asks every peer in config order, skipping ourselves. Peers that fail or have no answer
    /// are left out.
    async fn ask(&self, question: Question) -> Vec<Answer>;

    /// Registers the handler for `topic`; a topic takes one handler.
    fn answer_with(
        &self,
        topic: Topic,
        handler: Arc<dyn QuestionHandler>,
    ) -> Result<(), NetworkError>;

    /// Adds a listener for incoming messages.
    fn add_listener(&self, listener: Arc<dyn MessageListener>);
}
