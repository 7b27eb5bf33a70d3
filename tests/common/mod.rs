//! Shared harness for the integration tests: boots a whole server on
//! ephemeral ports and drives it over real TCP connections.
#![allow(dead_code)]

use haven::crypto::Keypair;
use haven::net::message::{
    ConversationPayload, ConversationRequest, ConversationResponse, SignatureBytes,
};
use haven::net::ServerContext;
use haven::replication::{PeerClient, WorkerError};
use haven::Config;
use std::net::SocketAddr;
use std::sync::Arc;

/// Boot a server with ephemeral ports in a scratch data dir.
pub async fn start_server() -> (tempfile::TempDir, Arc<ServerContext>) {
    start_server_with(|_| {}).await
}

pub async fn start_server_with<F: FnOnce(&mut Config)>(
    tweak: F,
) -> (tempfile::TempDir, Arc<ServerContext>) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config {
        data_dir: dir.path().to_path_buf(),
        bind_addr: "127.0.0.1".parse().unwrap(),
        primary_port: 0,
        server_neighbor_port: 0,
        client_non_customer_port: 0,
        client_customer_port: 0,
        client_app_service_port: 0,
        ..Config::default()
    };
    tweak(&mut config);

    let keypair = Keypair::generate();
    let ctx = haven::net::start(config, keypair).await.expect("server start");
    (dir, ctx)
}

pub async fn connect(port: u16) -> PeerClient {
    let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
    PeerClient::connect(addr).await.expect("connect")
}

/// Connect to the customer port and check the identity in:
/// Start + CheckIn on one connection.
pub async fn check_in(ctx: &Arc<ServerContext>, keypair: &Keypair) -> PeerClient {
    let mut client = connect(ctx.config.client_customer_port).await;
    let challenge = client.start_conversation(keypair).await.expect("start");
    let response = client
        .call(ConversationRequest::CheckIn {
            challenge,
            signature: SignatureBytes::new_unchecked(keypair.sign(&challenge).to_vec()),
        })
        .await
        .expect("check-in call");
    assert!(response.status.is_ok(), "check-in failed: {:?}", response.status);
    client
}

/// Register hosting for a keypair over the non-customer port.
pub async fn register(ctx: &Arc<ServerContext>, keypair: &Keypair) {
    let mut client = connect(ctx.config.client_non_customer_port).await;
    client.start_conversation(keypair).await.expect("start");
    let response = client
        .call(ConversationRequest::RegisterHosting {
            contract: signed_contract(keypair, "individual"),
        })
        .await
        .expect("register call");
    assert!(response.status.is_ok(), "register failed: {:?}", response.status);
}

pub fn signed_contract(
    keypair: &Keypair,
    plan_type: &str,
) -> haven::net::message::HostingContract {
    let mut contract = haven::net::message::HostingContract {
        public_key: keypair.public(),
        plan_type: plan_type.to_string(),
        valid_from: haven::now(),
        signature: SignatureBytes::default(),
    };
    contract.signature =
        SignatureBytes::new_unchecked(keypair.sign(&contract.signing_bytes()).to_vec());
    contract
}

/// Initialize a profile: version 1.0.0, name, location.
pub async fn init_profile(
    client: &mut PeerClient,
    name: &str,
    latitude: f64,
    longitude: f64,
) -> Result<ConversationResponse, WorkerError> {
    client
        .call(ConversationRequest::UpdateProfile(Box::new(
            haven::net::message::ProfileUpdate {
                set_version: true,
                version: haven::SemVer::V1,
                set_name: true,
                name: name.to_string(),
                set_location: true,
                latitude,
                longitude,
                ..Default::default()
            },
        )))
        .await
}

pub fn ok_payload(response: &ConversationResponse) -> &ConversationPayload {
    assert!(response.status.is_ok(), "unexpected status {:?}", response.status);
    &response.payload
}
