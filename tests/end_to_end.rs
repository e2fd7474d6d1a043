#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Client/server round trips over loopback TCP for both protocol versions.

use rand::rngs::OsRng;
use rsa::RsaPrivateKey;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use votifier_protocol::client::{V1Client, V2Client, VoteClient};
use votifier_protocol::core::v1;
use votifier_protocol::core::v2::CAUSE_DECODE;
use votifier_protocol::core::{CredentialRegistry, ProtocolVersion, ReceiverRecord, ServiceTokens, StaticToken, Vote};
use votifier_protocol::error::{constants, VotifierError};
use votifier_protocol::server::Server;
use votifier_protocol::utils::Metrics;

fn keys() -> &'static (RsaPrivateKey, RsaPrivateKey) {
    static KEYS: OnceLock<(RsaPrivateKey, RsaPrivateKey)> = OnceLock::new();
    KEYS.get_or_init(|| {
        (
            RsaPrivateKey::new(&mut OsRng, 1024).expect("key a"),
            RsaPrivateKey::new(&mut OsRng, 1024).expect("key b"),
        )
    })
}

fn big_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut OsRng, 2048).expect("key big"))
}

type Received = (Vote, ProtocolVersion, &'static str);

/// Server whose handler forwards every vote into a channel.
fn recording_server(records: Vec<ReceiverRecord<&'static str>>) -> (Server<&'static str>, UnboundedReceiver<Received>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let server = Server::new(
        CredentialRegistry::new(records),
        move |vote: Vote, version: ProtocolVersion, site: &&'static str| -> Result<(), String> {
            tx.send((vote, version, *site)).map_err(|e| e.to_string())
        },
    );
    (server, rx)
}

async fn start<M: Send + Sync + 'static>(server: Server<M>) -> (String, Arc<Metrics>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let metrics = server.metrics();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (address, metrics)
}

async fn next_vote(rx: &mut UnboundedReceiver<Received>) -> Received {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("handler was not called in time")
        .expect("handler channel closed")
}

async fn wait_for(metrics: &Metrics, condition: impl Fn(&Metrics) -> bool) {
    for _ in 0..100 {
        if condition(metrics) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("metrics never reached expected state: {:?}", metrics.snapshot());
}

#[tokio::test]
async fn test_v1_end_to_end() {
    let (key, _) = keys();
    let (server, mut rx) = recording_server(vec![ReceiverRecord::new("main").with_private_key(key.clone())]);
    let (address, metrics) = start(server).await;

    let vote = Vote::new("golang", "golang", "127.0.0.1");
    V1Client::new(address, key.to_public_key())
        .send_vote(&vote)
        .await
        .unwrap();

    let (received, version, site) = next_vote(&mut rx).await;
    assert_eq!(received, vote);
    assert_eq!(version, ProtocolVersion::V1);
    assert_eq!(site, "main");
    wait_for(&metrics, |m| m.snapshot().votes_v1 == 1).await;
}

#[tokio::test]
async fn test_v2_end_to_end() {
    let (server, mut rx) =
        recording_server(vec![ReceiverRecord::new("main").with_token_lookup(StaticToken::new("abcxyz"))]);
    let (address, metrics) = start(server).await;

    let vote = Vote::new("golang", "golang", "127.0.0.1");
    V2Client::new(address, "abcxyz").send_vote(&vote).await.unwrap();

    let (received, version, site) = next_vote(&mut rx).await;
    assert_eq!(received, vote);
    assert_eq!(version, ProtocolVersion::V2);
    assert_eq!(site, "main");
    assert_eq!(metrics.snapshot().votes_v2, 1);
}

#[tokio::test]
async fn test_both_versions_on_one_port() {
    let (key, _) = keys();
    let (server, mut rx) = recording_server(vec![ReceiverRecord::new("main")
        .with_private_key(key.clone())
        .with_token_lookup(StaticToken::new("abcxyz"))]);
    let (address, _) = start(server).await;

    V1Client::new(address.clone(), key.to_public_key())
        .send_vote(&Vote::new("list", "alice", "10.0.0.1"))
        .await
        .unwrap();
    assert_eq!(next_vote(&mut rx).await.1, ProtocolVersion::V1);

    V2Client::new(address, "abcxyz")
        .send_vote(&Vote::new("list", "bob", "10.0.0.2"))
        .await
        .unwrap();
    assert_eq!(next_vote(&mut rx).await.1, ProtocolVersion::V2);
}

#[tokio::test]
async fn test_v2_wrong_secret_reports_decode() {
    let (server, mut rx) =
        recording_server(vec![ReceiverRecord::new("main").with_token_lookup(StaticToken::new("abcxyz"))]);
    let (address, metrics) = start(server).await;

    let err = V2Client::new(address, "wrong")
        .send_vote(&Vote::new("golang", "golang", "127.0.0.1"))
        .await
        .unwrap_err();

    match err {
        VotifierError::Remote { cause, error } => {
            assert_eq!(cause, CAUSE_DECODE);
            assert_eq!(error, constants::ERR_DECODE_GENERIC);
        }
        other => panic!("expected remote decode error, got {other:?}"),
    }
    assert!(rx.try_recv().is_err(), "handler must not see rejected votes");
    assert_eq!(metrics.snapshot().decode_failures, 1);
}

#[tokio::test]
async fn test_v2_unknown_service_reports_decode() {
    let (server, _rx) = recording_server(vec![ReceiverRecord::new("main")
        .with_token_lookup(ServiceTokens::new().with_service("known", "abcxyz"))]);
    let (address, _) = start(server).await;

    let err = V2Client::new(address, "abcxyz")
        .send_vote(&Vote::new("unknown", "golang", "127.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, VotifierError::Remote { ref cause, .. } if cause == CAUSE_DECODE));
}

#[tokio::test]
async fn test_v2_handler_panic_reported() {
    let registry = CredentialRegistry::new(vec![ReceiverRecord::new(()).with_token_lookup(StaticToken::new("abcxyz"))]);
    let server = Server::new(
        registry,
        |_vote: Vote, _version: ProtocolVersion, _meta: &()| -> Result<(), String> { panic!("boom") },
    );
    let (address, metrics) = start(server).await;

    let err = V2Client::new(address, "abcxyz")
        .send_vote(&Vote::new("golang", "golang", "127.0.0.1"))
        .await
        .unwrap_err();

    assert!(
        err.to_string().ends_with("panic: boom"),
        "unexpected error text: {err}"
    );
    assert_eq!(metrics.snapshot().handler_faults, 1);
}

#[tokio::test]
async fn test_v2_handler_error_reported_as_panic_cause() {
    let registry = CredentialRegistry::new(vec![ReceiverRecord::new(()).with_token_lookup(StaticToken::new("abcxyz"))]);
    let server = Server::new(
        registry,
        |_vote: Vote, _version: ProtocolVersion, _meta: &()| -> Result<(), String> { Err("boom".into()) },
    );
    let (address, _) = start(server).await;

    let err = V2Client::new(address, "abcxyz")
        .send_vote(&Vote::new("golang", "golang", "127.0.0.1"))
        .await
        .unwrap_err();

    match err {
        VotifierError::Remote { cause, error } => {
            assert_eq!(cause, "panic");
            assert_eq!(error, "boom");
        }
        other => panic!("expected remote panic error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_v1_handler_failure_is_silent() {
    let (key, _) = keys();
    let registry = CredentialRegistry::new(vec![ReceiverRecord::new(()).with_private_key(key.clone())]);
    let server = Server::new(
        registry,
        |_vote: Vote, _version: ProtocolVersion, _meta: &()| -> Result<(), String> { panic!("boom") },
    );
    let (address, metrics) = start(server).await;

    V1Client::new(address, key.to_public_key())
        .send_vote(&Vote::new("golang", "golang", "127.0.0.1"))
        .await
        .unwrap();
    wait_for(&metrics, |m| m.snapshot().handler_faults == 1).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_fault_isolated_from_concurrent_vote() {
    let registry = CredentialRegistry::new(vec![ReceiverRecord::new(()).with_token_lookup(StaticToken::new("abcxyz"))]);
    let server = Server::new(
        registry,
        |vote: Vote, _version: ProtocolVersion, _meta: &()| -> Result<(), String> {
            if vote.username() == "mallory" {
                panic!("boom");
            }
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        },
    );
    let (address, metrics) = start(server).await;

    let bad = {
        let client = V2Client::new(address.clone(), "abcxyz");
        tokio::spawn(async move { client.send_vote(&Vote::new("list", "mallory", "10.0.0.66")).await })
    };
    let good = {
        let client = V2Client::new(address.clone(), "abcxyz");
        tokio::spawn(async move { client.send_vote(&Vote::new("list", "alice", "10.0.0.1")).await })
    };

    assert!(bad.await.unwrap().is_err());
    good.await.unwrap().unwrap();

    // Still accepting afterwards
    V2Client::new(address, "abcxyz")
        .send_vote(&Vote::new("list", "bob", "10.0.0.2"))
        .await
        .unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.handler_faults, 1);
    assert_eq!(snapshot.votes_v2, 2);
}

#[tokio::test]
async fn test_multi_credential_dispatch() {
    let (key_a, key_b) = keys();
    let (server, mut rx) = recording_server(vec![
        ReceiverRecord::new("A")
            .with_private_key(key_a.clone())
            .with_token_lookup(StaticToken::new("token-a")),
        ReceiverRecord::new("B")
            .with_private_key(key_b.clone())
            .with_token_lookup(StaticToken::new("token-b")),
    ]);
    let (address, _) = start(server).await;

    V2Client::new(address.clone(), "token-b")
        .send_vote(&Vote::new("list", "alice", "10.0.0.1"))
        .await
        .unwrap();
    let (_, version, site) = next_vote(&mut rx).await;
    assert_eq!((version, site), (ProtocolVersion::V2, "B"));

    V1Client::new(address.clone(), key_b.to_public_key())
        .send_vote(&Vote::new("list", "alice", "10.0.0.1"))
        .await
        .unwrap();
    let (_, version, site) = next_vote(&mut rx).await;
    assert_eq!((version, site), (ProtocolVersion::V1, "B"));

    V2Client::new(address, "token-a")
        .send_vote(&Vote::new("list", "carol", "10.0.0.3"))
        .await
        .unwrap();
    assert_eq!(next_vote(&mut rx).await.2, "A");
}

/// Read the greeting, write `ciphertext` and leave the socket open.
async fn send_v1_without_closing(address: &str, ciphertext: &[u8]) -> BufReader<TcpStream> {
    let mut reader = BufReader::new(TcpStream::connect(address).await.unwrap());
    let mut greeting = String::new();
    reader.read_line(&mut greeting).await.unwrap();
    assert!(greeting.starts_with("VOTIFIER 2 "));
    reader.get_mut().write_all(ciphertext).await.unwrap();
    reader.get_mut().flush().await.unwrap();
    reader
}

async fn vote_within(rx: &mut UnboundedReceiver<Received>, limit: Duration) -> Received {
    tokio::time::timeout(limit, rx.recv())
        .await
        .expect("vote was not delivered before the connection deadline")
        .expect("handler channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_v1_mixed_key_sizes_without_half_close() {
    let (small, _) = keys();
    let (server, mut rx) = recording_server(vec![
        ReceiverRecord::new("big").with_private_key(big_key().clone()),
        ReceiverRecord::new("small").with_private_key(small.clone()),
    ]);
    let (address, metrics) = start(server).await;

    // A block sized for the smaller key is decoded as soon as it arrives
    let vote = Vote::new("list", "alice", "10.0.0.1");
    let ciphertext = v1::encode(&vote, &small.to_public_key()).unwrap();
    assert_eq!(ciphertext.len(), 128);
    let _open = send_v1_without_closing(&address, &ciphertext).await;

    let (received, version, site) = vote_within(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(received, vote);
    assert_eq!((version, site), (ProtocolVersion::V1, "small"));

    // The first 128 bytes of a larger block match nothing; reading goes on
    let vote = Vote::new("list", "bob", "10.0.0.2");
    let ciphertext = v1::encode(&vote, &big_key().to_public_key()).unwrap();
    assert_eq!(ciphertext.len(), 256);
    let _open = send_v1_without_closing(&address, &ciphertext).await;

    let (received, version, site) = vote_within(&mut rx, Duration::from_secs(2)).await;
    assert_eq!(received, vote);
    assert_eq!((version, site), (ProtocolVersion::V1, "big"));

    wait_for(&metrics, |m| m.snapshot().votes_v1 == 2).await;
    assert_eq!(metrics.snapshot().decode_failures, 0);
}

#[tokio::test]
async fn test_v1_client_with_mixed_key_sizes() {
    let (small, _) = keys();
    let (server, mut rx) = recording_server(vec![
        ReceiverRecord::new("big").with_private_key(big_key().clone()),
        ReceiverRecord::new("small").with_private_key(small.clone()),
    ]);
    let (address, _) = start(server).await;

    for (public, expected) in [(small.to_public_key(), "small"), (big_key().to_public_key(), "big")] {
        V1Client::new(address.clone(), public)
            .send_vote(&Vote::new("list", "carol", "10.0.0.3"))
            .await
            .unwrap();
        assert_eq!(next_vote(&mut rx).await.2, expected);
    }
}

#[tokio::test]
async fn test_v2_to_v1_only_server_is_rejected() {
    let (key, _) = keys();
    let (server, _rx) = recording_server(vec![ReceiverRecord::new("main").with_private_key(key.clone())]);
    let (address, _) = start(server).await;

    let err = V2Client::new(address, "abcxyz")
        .send_vote(&Vote::new("golang", "golang", "127.0.0.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, VotifierError::Remote { ref cause, .. } if cause == CAUSE_DECODE));
}

#[tokio::test]
async fn test_v1_to_v2_only_server_counts_decode_failure() {
    let (key, _) = keys();
    let (server, mut rx) =
        recording_server(vec![ReceiverRecord::new("main").with_token_lookup(StaticToken::new("abcxyz"))]);
    let (address, metrics) = start(server).await;

    // v1 never reads a verdict, so the send itself succeeds
    V1Client::new(address, key.to_public_key())
        .send_vote(&Vote::new("golang", "golang", "127.0.0.1"))
        .await
        .unwrap();

    wait_for(&metrics, |m| m.snapshot().decode_failures == 1).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_clients_usable_as_trait_objects() {
    let (key, _) = keys();
    let (server, mut rx) = recording_server(vec![ReceiverRecord::new("main")
        .with_private_key(key.clone())
        .with_token_lookup(StaticToken::new("abcxyz"))]);
    let (address, _) = start(server).await;

    let clients: Vec<Box<dyn VoteClient>> = vec![
        Box::new(V1Client::new(address.clone(), key.to_public_key())),
        Box::new(V2Client::new(address, "abcxyz")),
    ];
    for client in &clients {
        client.send_vote(&Vote::new("list", "alice", "10.0.0.1")).await.unwrap();
        next_vote(&mut rx).await;
    }
}
