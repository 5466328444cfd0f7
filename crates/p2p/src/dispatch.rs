//! Routing of incoming questions and messages to the registered handlers and listeners.

use std::{collections::HashMap, fmt, sync::Arc};

use alloy::primitives::Address;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    errors::{AnswerError, NetworkError},
    messages::{MessageEnvelope, Question, Topic},
};

/// Answers questions on one topic.
#[async_trait]
pub trait QuestionHandler: Send + Sync {
    /// Answers `body` from `sender`. `Ok(None)` means there is nothing to say.
    async fn answer(&self, sender: Address, body: Value) -> Result<Option<Value>, AnswerError>;
}

/// Receives every message delivered to this node.
#[async_trait]
pub trait MessageListener: Send + Sync {
    /// Called once per delivered message.
    async fn on_message(&self, envelope: MessageEnvelope);
}

/// Handlers by topic plus message listeners, shared by every [`Network`](crate::Network)
/// implementation.
#[derive(Default)]
pub struct Dispatcher {
    handlers: RwLock<HashMap<Topic, Arc<dyn QuestionHandler>>>,
    listeners: RwLock<Vec<Arc<dyn MessageListener>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("topics", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl Dispatcher {
    /// Registers `handler` for `topic`. Each topic takes one handler.
    pub fn register(
        &self,
        topic: Topic,
        handler: Arc<dyn QuestionHandler>,
    ) -> Result<(), NetworkError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&topic) {
            return Err(NetworkError::DuplicateHandler(topic));
        }
        handlers.insert(topic, handler);
        Ok(())
    }

    /// Adds a message listener.
    pub fn add_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().push(listener);
    }

    /// Answers `question` from `sender`. Missing handlers and handler errors yield `None`.
    pub async fn answer(&self, sender: Address, question: Question) -> Option<Value> {
        let handler = self.handlers.read().get(&question.topic).cloned();
        let Some(handler) = handler else {
            warn!(topic = %question.topic, %sender, "no handler for question");
            return None;
        };
        match handler.answer(sender, question.body).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(topic = %question.topic, %sender, %e, "question handler failed");
                None
            }
        }
    }

    /// Hands `envelope` to every listener.
    pub async fn deliver(&self, envelope: MessageEnvelope) {
        debug!(sender = %envelope.sender, message = ?envelope.message, "received message");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_message(envelope.clone()).await;
        }
    }
}
