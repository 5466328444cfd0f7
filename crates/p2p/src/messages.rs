//! Wire types. Every payload is a plain serde struct; nothing on the wire names a Rust type.

use std::fmt;

use alloy::primitives::Address;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// Static identifier of a federator node, from config.
pub type NodeId = String;

/// What a question asks for. Peers only answer topics they registered a handler for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Sign a rune deposit for minting on the EVM side.
    SignRuneDepositToEvm,
    /// Sign a PSBT paying out rune token deposits on the BTC side.
    SignRuneTokenDepositToBtc,
    /// Sign every transfer of a Taproot-Assets batch.
    SignTapBatch,
    /// Approve paying out an EVM to Taproot-Assets batch.
    ApproveEvmToTapBatch,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SignRuneDepositToEvm => "sign_rune_deposit_to_evm",
            Self::SignRuneTokenDepositToBtc => "sign_rune_token_deposit_to_btc",
            Self::SignTapBatch => "sign_tap_batch",
            Self::ApproveEvmToTapBatch => "approve_evm_to_tap_batch",
        };
        f.write_str(name)
    }
}

/// A fire-and-forget message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum Message {
    /// A node came online.
    Joined {
        /// The node that joined.
        node_id: NodeId,
    },
    /// Free-form text for the operators' logs.
    Notice {
        /// The text.
        text: String,
    },
}

/// A message with the sender proven by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    /// Federator address of the sender.
    pub sender: Address,
    /// The message.
    pub message: Message,
}

/// A question for peers on `topic`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Question {
    /// What is being asked.
    pub topic: Topic,
    /// Topic-specific body.
    pub body: Value,
}

impl Question {
    /// Encodes `body` as a question on `topic`.
    pub fn new<T: Serialize>(topic: Topic, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            topic,
            body: serde_json::to_value(body)?,
        })
    }

    /// Decodes the body as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// One peer's answer to a question.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// Federator address of the peer that answered, proven by the transport.
    pub sender: Address,
    /// Topic-specific body.
    pub body: Value,
}

impl Answer {
    /// Decodes the body as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }
}

/// A request on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum PeerRequest {
    /// Deliver a message.
    Message(Message),
    /// Answer a question.
    Question(Question),
}

/// A response on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum PeerResponse {
    /// The message was delivered.
    Ack,
    /// The answer, if the peer had one.
    Answer(Option<Value>),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn unknown_topics_and_fields_are_rejected() {
        let bad_topic = json!({"question": {"topic": "launch_missiles", "body": {}}});
        assert!(serde_json::from_value::<PeerRequest>(bad_topic).is_err());

        let extra = json!({"question": {"topic": "sign_tap_batch", "body": {}, "type": "X"}});
        assert!(serde_json::from_value::<PeerRequest>(extra).is_err());

        let ok = json!({"question": {"topic": "sign_tap_batch", "body": {"hash": "00"}}});
        let PeerRequest::Question(q) = serde_json::from_value(ok).unwrap() else {
            panic!("expected a question");
        };
        assert_eq!(q.topic, Topic::SignTapBatch);
    }

    #[test]
    fn topic_display_matches_wire_name() {
        for topic in [
            Topic::SignRuneDepositToEvm,
            Topic::SignRuneTokenDepositToBtc,
            Topic::SignTapBatch,
            Topic::ApproveEvmToTapBatch,
        ] {
            assert_eq!(
                serde_json::to_value(topic).unwrap(),
                Value::String(topic.to_string())
            );
        }
    }
}
