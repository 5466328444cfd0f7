//! A [`Network`] within one process: every node registers on a shared hub.

use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::warn;

use crate::{
    dispatch::{Dispatcher, MessageListener, QuestionHandler},
    errors::NetworkError,
    messages::{Answer, Message, MessageEnvelope, NodeId, Question, Topic},
    network::Network,
};

#[derive(Debug)]
struct Member {
    node_id: NodeId,
    address: Address,
    dispatcher: Arc<Dispatcher>,
}

/// The shared hub. Nodes are asked in the order they joined.
#[derive(Debug)]
pub struct InMemoryHub {
    members: RwLock<Vec<Member>>,
    leader_id: NodeId,
}

impl InMemoryHub {
    /// Creates a hub whose leader is `leader_id`.
    pub fn new(leader_id: impl Into<NodeId>) -> Arc<Self> {
        Arc::new(Self {
            members: RwLock::new(Vec::new()),
            leader_id: leader_id.into(),
        })
    }

    /// Adds a node with federator address `address`.
    pub fn join(self: &Arc<Self>, node_id: impl Into<NodeId>, address: Address) -> InMemoryNetwork {
        let node_id = node_id.into();
        let dispatcher = Arc::new(Dispatcher::default());
        self.members.write().push(Member {
            node_id: node_id.clone(),
            address,
            dispatcher: dispatcher.clone(),
        });
        InMemoryNetwork {
            node_id,
            address,
            leader_id: self.leader_id.clone(),
            hub: self.clone(),
            dispatcher,
        }
    }

    /// Removes a node, as if it went offline.
    pub fn leave(&self, node_id: &str) {
        self.members.write().retain(|m| m.node_id != node_id);
    }

    fn peers_of(&self, node_id: &str) -> Vec<(NodeId, Address, Arc<Dispatcher>)> {
        self.members
            .read()
            .iter()
            .filter(|m| m.node_id != node_id)
            .map(|m| (m.node_id.clone(), m.address, m.dispatcher.clone()))
            .collect()
    }

    fn dispatcher_of(&self, node_id: &str) -> Option<Arc<Dispatcher>> {
        self.members
            .read()
            .iter()
            .find(|m| m.node_id == node_id)
            .map(|m| m.dispatcher.clone())
    }
}

/// One node's handle on an [`InMemoryHub`].
#[derive(Debug, Clone)]
pub struct InMemoryNetwork {
    node_id: NodeId,
    address: Address,
    leader_id: NodeId,
    hub: Arc<InMemoryHub>,
    dispatcher: Arc<Dispatcher>,
}

impl InMemoryNetwork {
    /// This node's federator address.
    pub const fn address(&self) -> Address {
        self.address
    }
}

#[async_trait]
impl Network for InMemoryNetwork {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn leader_id(&self) -> &NodeId {
        &self.leader_id
    }

    async fn broadcast(&self, msg: Message) {
        for (_, _, dispatcher) in self.hub.peers_of(&self.node_id) {
            dispatcher
                .deliver(MessageEnvelope {
                    sender: self.address,
                    message: msg.clone(),
                })
                .await;
        }
    }

    async fn send(&self, to: &NodeId, msg: Message) -> Result<(), NetworkError> {
        let dispatcher = self
            .hub
            .dispatcher_of(to)
            .ok_or_else(|| NetworkError::UnknownPeer(to.clone()))?;
        dispatcher
            .deliver(MessageEnvelope {
                sender: self.address,
                message: msg,
            })
            .await;
        Ok(())
    }

    async fn ask(&self, question: Question) -> Vec<Answer> {
        let mut answers = Vec::new();
        for (node_id, address, dispatcher) in self.hub.peers_of(&self.node_id) {
            match dispatcher.answer(self.address, question.clone()).await {
                Some(body) => answers.push(Answer {
                    sender: address,
                    body,
                }),
                None => warn!(peer = %node_id, topic = %question.topic, "no answer from peer"),
            }
        }
        answers
    }

    fn answer_with(
        &self,
        topic: Topic,
        handler: Arc<dyn QuestionHandler>,
    ) -> Result<(), NetworkError> {
        self.dispatcher.register(topic, handler)
    }

    fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.dispatcher.add_listener(listener);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::errors::AnswerError;

    #[derive(Debug)]
    struct Fixed(Option<Value>);

    #[async_trait]
    impl QuestionHandler for Fixed {
        async fn answer(
            &self,
            _sender: Address,
            _body: Value,
        ) -> Result<Option<Value>, AnswerError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Debug)]
    struct Failing;

    #[async_trait]
    impl QuestionHandler for Failing {
        async fn answer(&self, _sender: Address, _body: Value) -> Result<Option<Value>, AnswerError> {
            Err(AnswerError("refused".into()))
        }
    }

    #[derive(Debug)]
    struct EchoSender;

    #[async_trait]
    impl QuestionHandler for EchoSender {
        async fn answer(&self, sender: Address, _body: Value) -> Result<Option<Value>, AnswerError> {
            Ok(Some(json!(sender)))
        }
    }

    #[derive(Default)]
    struct Recorder(RwLock<Vec<MessageEnvelope>>);

    #[async_trait]
    impl MessageListener for Recorder {
        async fn on_message(&self, envelope: MessageEnvelope) {
            self.0.write().push(envelope);
        }
    }

    fn question() -> Question {
        Question::new(Topic::SignTapBatch, &json!({"hash": "00"})).unwrap()
    }

    #[tokio::test]
    async fn ask_skips_self_and_drops_missing_answers() {
        let hub = InMemoryHub::new("a");
        let a = hub.join("a", Address::repeat_byte(0xa));
        let b = hub.join("b", Address::repeat_byte(0xb));
        let c = hub.join("c", Address::repeat_byte(0xc));
        let d = hub.join("d", Address::repeat_byte(0xd));

        a.answer_with(Topic::SignTapBatch, Arc::new(Fixed(Some(json!("self")))))
            .unwrap();
        b.answer_with(Topic::SignTapBatch, Arc::new(Fixed(Some(json!("b")))))
            .unwrap();
        c.answer_with(Topic::SignTapBatch, Arc::new(Failing)).unwrap();
        // d has no handler
        let _ = d;

        let answers = a.ask(question()).await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].sender, Address::repeat_byte(0xb));
        assert_eq!(answers[0].body, json!("b"));
        assert!(a.is_leader());
        assert!(!b.is_leader());
    }

    #[tokio::test]
    async fn handler_sees_asker_identity() {
        let hub = InMemoryHub::new("a");
        let a = hub.join("a", Address::repeat_byte(0xa));
        let b = hub.join("b", Address::repeat_byte(0xb));
        b.answer_with(Topic::SignTapBatch, Arc::new(EchoSender)).unwrap();

        let answers = a.ask(question()).await;
        let seen: Address = answers[0].decode().unwrap();
        assert_eq!(seen, a.address());
    }

    #[tokio::test]
    async fn one_handler_per_topic() {
        let hub = InMemoryHub::new("a");
        let a = hub.join("a", Address::repeat_byte(0xa));
        a.answer_with(Topic::SignTapBatch, Arc::new(Failing)).unwrap();
        let err = a
            .answer_with(Topic::SignTapBatch, Arc::new(Failing))
            .unwrap_err();
        assert!(matches!(err, NetworkError::DuplicateHandler(Topic::SignTapBatch)));
    }

    #[tokio::test]
    async fn broadcast_and_send_reach_listeners() {
        let hub = InMemoryHub::new("a");
        let a = hub.join("a", Address::repeat_byte(0xa));
        let b = hub.join("b", Address::repeat_byte(0xb));
        let c = hub.join("c", Address::repeat_byte(0xc));
        let b_inbox = Arc::new(Recorder::default());
        let c_inbox = Arc::new(Recorder::default());
        b.add_listener(b_inbox.clone());
        c.add_listener(c_inbox.clone());

        a.broadcast(Message::Joined { node_id: "a".into() }).await;
        a.send(&"c".to_string(), Message::Notice { text: "hi".into() })
            .await
            .unwrap();

        assert_eq!(b_inbox.0.read().len(), 1);
        assert_eq!(c_inbox.0.read().len(), 2);
        assert_eq!(c_inbox.0.read()[1].sender, a.address());
        assert!(a
            .send(&"zz".to_string(), Message::Notice { text: "?".into() })
            .await
            .is_err());
    }
}
