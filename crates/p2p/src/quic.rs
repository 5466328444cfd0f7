//! [`Network`] over the authenticated QUIC transport.

use std::{collections::HashMap, sync::Arc, time::Duration};

use alloy::primitives::Address;
use async_trait::async_trait;
use federator_transport::{
    rustls,
    server::{bind, serve},
    ClientConfig, Endpoint, HandshakeAuthenticator, ServerConfig, Service, TransportClient,
};
use serde::Deserialize;
use tokio::{net::lookup_host, sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    dispatch::{Dispatcher, MessageListener, QuestionHandler},
    errors::NetworkError,
    messages::{
        Answer, Message, MessageEnvelope, NodeId, PeerRequest, PeerResponse, Question, Topic,
    },
    network::Network,
};

/// One entry of the static peer list.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerConfig {
    /// The peer's node id.
    pub node_id: NodeId,
    /// `host:port` of the peer's QUIC server.
    pub address: String,
    /// Name on the peer's server certificate.
    pub server_name: String,
}

/// A node on the QUIC federation network.
///
/// Connections to peers are opened on first use and reopened after they close.
#[derive(Debug)]
pub struct QuicNetwork {
    node_id: NodeId,
    leader_id: NodeId,
    peers: Vec<PeerConfig>,
    auth: Arc<HandshakeAuthenticator>,
    client_tls: rustls::ClientConfig,
    timeout: Duration,
    clients: Mutex<HashMap<NodeId, TransportClient>>,
    dispatcher: Arc<Dispatcher>,
}

impl QuicNetwork {
    /// Creates the node. Nothing is bound or dialed until used.
    pub fn new(
        node_id: NodeId,
        leader_id: NodeId,
        peers: Vec<PeerConfig>,
        auth: Arc<HandshakeAuthenticator>,
        client_tls: rustls::ClientConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            node_id,
            leader_id,
            peers,
            auth,
            client_tls,
            timeout,
            clients: Mutex::new(HashMap::new()),
            dispatcher: Arc::new(Dispatcher::default()),
        }
    }

    /// Binds the server, starts serving peers and announces this node.
    pub async fn start(&self, config: ServerConfig) -> Result<JoinHandle<()>, NetworkError> {
        let endpoint = bind(config).map_err(|e| NetworkError::Bind(format!("{e:?}")))?;
        let handle = self.serve_on(endpoint);
        self.broadcast(Message::Joined {
            node_id: self.node_id.clone(),
        })
        .await;
        Ok(handle)
    }

    /// Serves peers on an already bound endpoint.
    pub fn serve_on(&self, endpoint: Endpoint) -> JoinHandle<()> {
        if let Ok(addr) = endpoint.local_addr() {
            info!(node_id = %self.node_id, %addr, "serving peers");
        }
        let service = Arc::new(PeerService {
            dispatcher: self.dispatcher.clone(),
        });
        tokio::spawn(serve(endpoint, None, self.auth.clone(), service))
    }

    fn peer(&self, node_id: &str) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.node_id == node_id)
    }

    async fn client(&self, peer: &PeerConfig) -> Result<TransportClient, NetworkError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&peer.node_id) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            debug!(peer = %peer.node_id, "connection closed, reconnecting");
        }

        let server_addr = lookup_host(peer.address.as_str())
            .await
            .map_err(|e| NetworkError::Resolve(format!("{}: {e}", peer.address)))?
            .next()
            .ok_or_else(|| NetworkError::Resolve(peer.address.clone()))?;
        let client = TransportClient::connect(
            ClientConfig {
                server_addr,
                server_hostname: peer.server_name.clone(),
                local_addr: None,
                tls_config: self.client_tls.clone(),
                timeout: self.timeout,
            },
            &self.auth,
        )
        .await?;
        clients.insert(peer.node_id.clone(), client.clone());
        Ok(client)
    }

    async fn request(
        &self,
        peer: &PeerConfig,
        request: &PeerRequest,
    ) -> Result<(Address, PeerResponse), NetworkError> {
        let client = self.client(peer).await?;
        match client.request(request).await {
            Ok(response) => Ok((client.peer(), response)),
            Err(e) => {
                self.clients.lock().await.remove(&peer.node_id);
                Err(e.into())
            }
        }
    }

    fn other_peers(&self) -> impl Iterator<Item = &PeerConfig> {
        self.peers.iter().filter(|p| p.node_id != self.node_id)
    }
}

#[async_trait]
impl Network for QuicNetwork {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn leader_id(&self) -> &NodeId {
        &self.leader_id
    }

    async fn broadcast(&self, msg: Message) {
        let request = PeerRequest::Message(msg);
        for peer in self.other_peers() {
            if let Err(e) = self.request(peer, &request).await {
                warn!(peer = %peer.node_id, %e, "failed to deliver message");
            }
        }
    }

    async fn send(&self, to: &NodeId, msg: Message) -> Result<(), NetworkError> {
        let peer = self
            .peer(to)
            .ok_or_else(|| NetworkError::UnknownPeer(to.clone()))?;
        match self.request(peer, &PeerRequest::Message(msg)).await? {
            (_, PeerResponse::Ack) => Ok(()),
            _ => Err(NetworkError::UnexpectedResponse(to.clone())),
        }
    }

    async fn ask(&self, question: Question) -> Vec<Answer> {
        let topic = question.topic;
        let request = PeerRequest::Question(question);
        let mut answers = Vec::new();
        for peer in self.other_peers() {
            match self.request(peer, &request).await {
                Ok((sender, PeerResponse::Answer(Some(body)))) => {
                    answers.push(Answer { sender, body })
                }
                Ok((_, PeerResponse::Answer(None))) => {
                    debug!(peer = %peer.node_id, %topic, "peer had no answer")
                }
                Ok((_, PeerResponse::Ack)) => {
                    warn!(peer = %peer.node_id, %topic, "peer acked a question")
                }
                Err(e) => warn!(peer = %peer.node_id, %topic, %e, "failed to ask peer"),
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

/// Serves peer requests out of the dispatcher.
#[derive(Debug)]
struct PeerService {
    dispatcher: Arc<Dispatcher>,
}

#[async_trait]
impl Service for PeerService {
    type Request = PeerRequest;
    type Response = PeerResponse;

    async fn handle(&self, peer: Address, request: PeerRequest) -> PeerResponse {
        match request {
            PeerRequest::Message(message) => {
                self.dispatcher
                    .deliver(MessageEnvelope {
                        sender: peer,
                        message,
                    })
                    .await;
                PeerResponse::Ack
            }
            PeerRequest::Question(question) => {
                PeerResponse::Answer(self.dispatcher.answer(peer, question).await)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::Ipv4Addr, path::Path};

    use alloy::signers::local::PrivateKeySigner;
    use federator_transport::{
        tls::{install_crypto_provider, load_client_config, load_server_config, TlsPaths},
        StaticFederators,
    };
    use parking_lot::RwLock;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use serde_json::{json, Value};

    use super::*;
    use crate::errors::AnswerError;

    #[derive(Debug)]
    struct WhoAsked;

    #[async_trait]
    impl QuestionHandler for WhoAsked {
        async fn answer(
            &self,
            sender: Address,
            _body: Value,
        ) -> Result<Option<Value>, AnswerError> {
            Ok(Some(json!(sender)))
        }
    }

    #[derive(Default)]
    struct Inbox(RwLock<Vec<MessageEnvelope>>);

    #[async_trait]
    impl MessageListener for Inbox {
        async fn on_message(&self, envelope: MessageEnvelope) {
            self.0.write().push(envelope);
        }
    }

    fn federation_pki(dir: &Path) -> TlsPaths {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec!["localhost".to_string()])
            .unwrap()
            .signed_by(&key, &ca, &ca_key)
            .unwrap();

        let write = |name: &str, pem: String| {
            let path = dir.join(name);
            std::fs::write(&path, pem).unwrap();
            path
        };
        let cert_path = write("node.pem", cert.pem());
        let key_path = write("node.key", key.serialize_pem());
        TlsPaths {
            server_cert: cert_path.clone(),
            server_key: key_path.clone(),
            client_cert: cert_path,
            client_key: key_path,
            ca_cert: write("ca.pem", ca.pem()),
        }
    }

    #[tokio::test]
    async fn questions_and_messages_over_quic() {
        install_crypto_provider();
        let dir = tempfile::tempdir().unwrap();
        let paths = federation_pki(dir.path());

        let signers: Vec<_> = (0..3).map(|_| PrivateKeySigner::random()).collect();
        let federators = Arc::new(StaticFederators(
            signers.iter().map(|s| s.address()).collect(),
        ));

        let mut endpoints = Vec::new();
        let mut peers = Vec::new();
        for i in 0..3 {
            let endpoint = bind(ServerConfig {
                addr: (Ipv4Addr::LOCALHOST, 0).into(),
                connection_limit: None,
                tls_config: load_server_config(&paths).await.unwrap(),
            })
            .unwrap();
            peers.push(PeerConfig {
                node_id: format!("node-{i}"),
                address: endpoint.local_addr().unwrap().to_string(),
                server_name: "localhost".to_string(),
            });
            endpoints.push(endpoint);
        }

        let mut nodes = Vec::new();
        for (i, endpoint) in endpoints.into_iter().enumerate() {
            let node = QuicNetwork::new(
                format!("node-{i}"),
                "node-0".to_string(),
                peers.clone(),
                Arc::new(HandshakeAuthenticator::new(
                    signers[i].clone(),
                    federators.clone(),
                )),
                load_client_config(&paths).await.unwrap(),
                Duration::from_secs(3),
            );
            node.serve_on(endpoint);
            nodes.push(node);
        }

        // node-2 registers nothing and is left out of the answers
        nodes[1]
            .answer_with(Topic::SignTapBatch, Arc::new(WhoAsked))
            .unwrap();
        let inbox = Arc::new(Inbox::default());
        nodes[2].add_listener(inbox.clone());

        assert!(nodes[0].is_leader());
        let answers = nodes[0]
            .ask(Question::new(Topic::SignTapBatch, &json!({})).unwrap())
            .await;
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].sender, signers[1].address());
        let seen: Address = answers[0].decode().unwrap();
        assert_eq!(seen, signers[0].address());

        nodes[0]
            .send(&"node-2".to_string(), Message::Notice { text: "hello".into() })
            .await
            .unwrap();
        let received = inbox.0.read().clone();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].sender, signers[0].address());
        assert!(nodes[0]
            .send(&"node-9".to_string(), Message::Notice { text: "?".into() })
            .await
            .is_err());
    }
}
