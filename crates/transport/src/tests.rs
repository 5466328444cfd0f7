use std::{
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    sync::Arc,
    time::Duration,
};

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use async_trait::async_trait;
use rcgen::{BasicConstraints, Certificate, CertificateParams, IsCa, KeyPair};

use crate::{
    client::{ClientConfig, ClientError, TransportClient},
    federators::StaticFederators,
    handshake::HandshakeAuthenticator,
    server::{bind, serve, Config, Service},
    tls::{install_crypto_provider, load_client_config, load_server_config, TlsPaths},
};

#[derive(Debug)]
struct Echo;

#[async_trait]
impl Service for Echo {
    type Request = String;
    type Response = String;

    async fn handle(&self, peer: Address, request: String) -> String {
        format!("{peer}:{request}")
    }
}

fn write_signed(dir: &Path, name: &str, ca: &Certificate, ca_key: &KeyPair) -> (String, String) {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .signed_by(&key, ca, ca_key)
        .unwrap();
    let cert_path = dir.join(format!("{name}.pem"));
    let key_path = dir.join(format!("{name}.key"));
    std::fs::write(&cert_path, cert.pem()).unwrap();
    std::fs::write(&key_path, key.serialize_pem()).unwrap();
    (
        cert_path.display().to_string(),
        key_path.display().to_string(),
    )
}

fn federation_pki(dir: &Path) -> TlsPaths {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key).unwrap();
    let ca_path = dir.join("ca.pem");
    std::fs::write(&ca_path, ca.pem()).unwrap();

    let (server_cert, server_key) = write_signed(dir, "server", &ca, &ca_key);
    let (client_cert, client_key) = write_signed(dir, "client", &ca, &ca_key);
    TlsPaths {
        server_cert: server_cert.into(),
        server_key: server_key.into(),
        client_cert: client_cert.into(),
        client_key: client_key.into(),
        ca_cert: ca_path,
    }
}

async fn start_server(
    paths: &TlsPaths,
    signer: PrivateKeySigner,
    federators: Vec<Address>,
) -> SocketAddr {
    let endpoint = bind(Config {
        addr: (Ipv4Addr::LOCALHOST, 0).into(),
        connection_limit: Some(8),
        tls_config: load_server_config(paths).await.unwrap(),
    })
    .unwrap();
    let addr = endpoint.local_addr().unwrap();
    let auth = Arc::new(HandshakeAuthenticator::new(
        signer,
        Arc::new(StaticFederators(federators)),
    ));
    tokio::spawn(serve(endpoint, Some(8), auth, Arc::new(Echo)));
    addr
}

async fn client_config(paths: &TlsPaths, server_addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        server_addr,
        server_hostname: "localhost".to_string(),
        local_addr: None,
        tls_config: load_client_config(paths).await.unwrap(),
        timeout: Duration::from_secs(3),
    }
}

#[tokio::test]
async fn e2e() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let paths = federation_pki(dir.path());

    let server_signer = PrivateKeySigner::random();
    let client_signer = PrivateKeySigner::random();
    let federators = vec![server_signer.address(), client_signer.address()];

    let addr = start_server(&paths, server_signer.clone(), federators.clone()).await;
    let auth = HandshakeAuthenticator::new(
        client_signer.clone(),
        Arc::new(StaticFederators(federators)),
    );
    let client = TransportClient::connect(client_config(&paths, addr).await, &auth)
        .await
        .expect("good conn");
    assert_eq!(client.peer(), server_signer.address());

    // the server sees the identity proven in the handshake
    let response: String = client.request(&"ping".to_string()).await.unwrap();
    assert_eq!(response, format!("{}:ping", client_signer.address()));

    let second: String = client.request(&"again".to_string()).await.unwrap();
    assert!(second.ends_with(":again"));
}

#[tokio::test]
async fn non_federator_is_rejected() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let paths = federation_pki(dir.path());

    let server_signer = PrivateKeySigner::random();
    let outsider = PrivateKeySigner::random();

    let addr = start_server(&paths, server_signer.clone(), vec![server_signer.address()]).await;
    // the outsider trusts the server, but the server does not list the outsider
    let auth = HandshakeAuthenticator::new(
        outsider.clone(),
        Arc::new(StaticFederators(vec![
            server_signer.address(),
            outsider.address(),
        ])),
    );
    let result = TransportClient::connect(client_config(&paths, addr).await, &auth).await;
    assert!(matches!(result, Err(ClientError::Handshake(_))));
}

#[tokio::test]
async fn client_rejects_non_federator_server() {
    install_crypto_provider();
    let dir = tempfile::tempdir().unwrap();
    let paths = federation_pki(dir.path());

    let server_signer = PrivateKeySigner::random();
    let client_signer = PrivateKeySigner::random();

    let addr = start_server(
        &paths,
        server_signer.clone(),
        vec![server_signer.address(), client_signer.address()],
    )
    .await;
    let auth = HandshakeAuthenticator::new(
        client_signer.clone(),
        Arc::new(StaticFederators(vec![client_signer.address()])),
    );
    let result = TransportClient::connect(client_config(&paths, addr).await, &auth).await;
    assert!(matches!(result, Err(ClientError::Handshake(_))));
}
