//! Gathering co-signatures from peers until the threshold is met.

use std::{future::Future, time::Duration};

use alloy::primitives::Address;
use federator_common::retry::linear_delay;
use federator_p2p::{Answer, Network, Question};
use tracing::{debug, info, warn};

use crate::errors::BridgeResult;

/// How hard the leader tries to reach the threshold in one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectConfig {
    /// Rounds of asking every peer.
    pub max_attempts: usize,
    /// Wait before the second round. Each later round waits one more unit.
    pub backoff_unit: Duration,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_unit: Duration::from_secs(5),
        }
    }
}

/// Asks peers `question` until `required` distinct signers have signed.
///
/// Starts from `initial`, normally our own signature. Answers from signers already present are
/// skipped; the rest go through `validate`, and those failing it are dropped. Returns at most
/// `required` signatures, fewer if the attempts ran out.
pub async fn collect_signatures<T, F, Fut>(
    network: &dyn Network,
    question: &Question,
    initial: Vec<(Address, T)>,
    required: usize,
    config: &CollectConfig,
    mut validate: F,
) -> Vec<(Address, T)>
where
    F: FnMut(Answer) -> Fut,
    Fut: Future<Output = BridgeResult<T>>,
{
    let mut collected = Vec::with_capacity(required);
    for (signer, value) in initial {
        if !collected.iter().any(|(s, _)| *s == signer) {
            collected.push((signer, value));
        }
    }

    for attempt in 0..config.max_attempts {
        if collected.len() >= required {
            break;
        }
        if attempt > 0 {
            tokio::time::sleep(linear_delay(config.backoff_unit, attempt - 1)).await;
        }

        for answer in network.ask(question.clone()).await {
            if collected.len() >= required {
                break;
            }
            let sender = answer.sender;
            if collected.iter().any(|(s, _)| *s == sender) {
                debug!(%sender, "already have a signature from peer");
                continue;
            }
            match validate(answer).await {
                Ok(value) => collected.push((sender, value)),
                Err(e) => warn!(%sender, topic = %question.topic, %e, "dropping invalid answer"),
            }
        }
        info!(
            topic = %question.topic,
            attempt,
            collected = collected.len(),
            required,
            "collected signatures"
        );
    }

    collected.truncate(required);
    collected
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use federator_p2p::{AnswerError, InMemoryHub, QuestionHandler, Topic};
    use serde_json::{json, Value};

    use super::*;
    use crate::errors::BridgeError;

    #[derive(Debug)]
    struct Signs(&'static str);

    #[async_trait]
    impl QuestionHandler for Signs {
        async fn answer(&self, _sender: Address, _body: Value) -> Result<Option<Value>, AnswerError> {
            Ok(Some(json!(self.0)))
        }
    }

    fn fast() -> CollectConfig {
        CollectConfig {
            max_attempts: 2,
            backoff_unit: Duration::from_millis(1),
        }
    }

    fn accept_ok(answer: Answer) -> impl Future<Output = BridgeResult<String>> {
        async move {
            let body: String = answer.decode()?;
            if body == "forged" {
                return Err(BridgeError::invalid("forged"));
            }
            Ok(body)
        }
    }

    #[tokio::test]
    async fn two_of_three_reaches_quorum() {
        let hub = InMemoryHub::new("leader");
        let leader = hub.join("leader", Address::repeat_byte(1));
        let b = hub.join("b", Address::repeat_byte(2));
        let c = hub.join("c", Address::repeat_byte(3));
        b.answer_with(Topic::SignTapBatch, Arc::new(Signs("b"))).unwrap();
        c.answer_with(Topic::SignTapBatch, Arc::new(Signs("c"))).unwrap();

        let question = Question::new(Topic::SignTapBatch, &json!({})).unwrap();
        let own = vec![(leader.address(), "leader".to_string())];
        let sigs = collect_signatures(&leader, &question, own, 2, &fast(), accept_ok).await;

        assert_eq!(
            sigs,
            vec![
                (Address::repeat_byte(1), "leader".to_string()),
                (Address::repeat_byte(2), "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn invalid_answers_do_not_count() {
        let hub = InMemoryHub::new("leader");
        let leader = hub.join("leader", Address::repeat_byte(1));
        let b = hub.join("b", Address::repeat_byte(2));
        let c = hub.join("c", Address::repeat_byte(3));
        b.answer_with(Topic::SignTapBatch, Arc::new(Signs("forged"))).unwrap();
        c.answer_with(Topic::SignTapBatch, Arc::new(Signs("c"))).unwrap();

        let question = Question::new(Topic::SignTapBatch, &json!({})).unwrap();
        let own = vec![(leader.address(), "leader".to_string())];
        let sigs = collect_signatures(&leader, &question, own, 3, &fast(), accept_ok).await;

        assert_eq!(sigs.len(), 2);
        assert!(sigs.iter().all(|(_, s)| s != "forged"));
    }

    #[tokio::test]
    async fn offline_peers_leave_the_threshold_unmet() {
        let hub = InMemoryHub::new("leader");
        let leader = hub.join("leader", Address::repeat_byte(1));
        let b = hub.join("b", Address::repeat_byte(2));
        b.answer_with(Topic::SignTapBatch, Arc::new(Signs("b"))).unwrap();
        hub.leave("b");

        let question = Question::new(Topic::SignTapBatch, &json!({})).unwrap();
        let own = vec![(leader.address(), "leader".to_string())];
        let sigs = collect_signatures(&leader, &question, own, 2, &fast(), accept_ok).await;

        assert_eq!(sigs.len(), 1);
    }
}
