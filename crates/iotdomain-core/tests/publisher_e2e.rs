//! End-to-end tests: several publishers on one in-process bus
//!
//! Covers identity exchange, signed and encrypted commands, forged
//! identities and DSS-driven identity rotation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use iotdomain_core::envelope::SignedEnvelope;
use iotdomain_core::identity::store;
use iotdomain_core::{
    issue_identity, IdentityRequest, IdentityState, InputDiscovery, Issuer, MemoryBus,
    MessageSigner, NodeDiscovery, OutputDiscovery, Publisher, PublisherConfig, PublisherError,
    SetInputMessage, Transport,
};

// ============================================================================
// Test Utilities
// ============================================================================

fn config(publisher_id: &str) -> PublisherConfig {
    PublisherConfig {
        tick_ms: 10,
        ..PublisherConfig::new("home", publisher_id)
    }
}

async fn start(bus: &Arc<MemoryBus>, config: PublisherConfig) -> Publisher {
    let publisher = Publisher::new(config, bus.clone()).unwrap();
    publisher.start().await.unwrap();
    publisher
}

/// Give every loop a few ticks to publish
async fn settle() {
    tokio::time::sleep(Duration::from_millis(80)).await;
}

/// Record every `$set` the publisher accepts
fn capture_set_input(publisher: &Publisher) -> Arc<Mutex<Vec<SetInputMessage>>> {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    publisher.set_input_handler(move |_, _, message| sink.lock().push(message.clone()));
    received
}

// ============================================================================
// Identity exchange and signed commands
// ============================================================================

#[tokio::test]
async fn test_self_signed_identity_accepted_and_command_verified() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    owner.update_input(InputDiscovery::new("home", "pub1", "node1", "switch", "0"));
    let received = capture_set_input(&owner);

    let sender = start(&bus, config("pub2")).await;
    settle().await;

    // each side trusts the other's self-signed identity
    let sender_key = sender.identity().public_identity().unwrap().key().unwrap();
    assert_eq!(owner.identity().get_publisher_key("home/pub2"), Some(sender_key));
    assert!(sender.identity().get_publisher_key("home/pub1").is_some());

    sender
        .set_remote_input("home/pub1/node1/switch/0/$input", "on", false)
        .unwrap();

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].value, "on");
    assert_eq!(received[0].sender, "home/pub2");
    assert_eq!(received[0].address, "home/pub1/node1/switch/0/$set");

    owner.stop().await;
    sender.stop().await;
}

#[tokio::test]
async fn test_discovery_reaches_other_publishers() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    owner.update_node(NodeDiscovery::new("home", "pub1", "node1", "thermostat"));
    owner.update_input(InputDiscovery::new("home", "pub1", "node1", "setpoint", "0"));
    owner.update_output(OutputDiscovery::new("home", "pub1", "node1", "temperature", "0"));
    settle().await;

    // a late subscriber is served from retained messages
    let observer = start(&bus, config("pub2")).await;
    settle().await;

    assert_eq!(
        observer.domain_nodes().get("home/pub1/node1").unwrap().node_type,
        "thermostat"
    );
    assert_eq!(observer.domain_inputs().get_all_by_prefix("home/pub1").len(), 1);
    assert_eq!(observer.domain_outputs().get_all_by_prefix("home/pub1").len(), 1);

    owner.stop().await;
    observer.stop().await;
}

#[tokio::test]
async fn test_discovery_body_must_match_its_address() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    let observer = start(&bus, config("pub2")).await;
    settle().await;

    // correctly signed by pub1, but the body claims another publisher
    let mut node = NodeDiscovery::new("home", "pub1", "node1", "sensor");
    node.publisher_id = "pub3".to_string();
    owner
        .signer()
        .publish_signed("home/pub1/node1/$node", true, &node)
        .unwrap();
    assert!(observer.domain_nodes().get("home/pub1/node1").is_none());

    let genuine = NodeDiscovery::new("home", "pub1", "node1", "sensor");
    owner
        .signer()
        .publish_signed("home/pub1/node1/$node", true, &genuine)
        .unwrap();
    assert_eq!(observer.domain_nodes().get("home/pub1/node1"), Some(genuine));

    owner.stop().await;
    observer.stop().await;
}

#[tokio::test]
async fn test_unsigned_command_rejected() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    owner.update_input(InputDiscovery::new("home", "pub1", "node1", "switch", "0"));
    let received = capture_set_input(&owner);
    settle().await;

    let message = SetInputMessage {
        address: "home/pub1/node1/switch/0/$set".to_string(),
        sender: "home/pub2".to_string(),
        timestamp: chrono::Utc::now(),
        value: "on".to_string(),
    };
    bus.publish(
        &message.address,
        false,
        &serde_json::to_string(&message).unwrap(),
    )
    .unwrap();

    assert!(received.lock().is_empty());
    owner.stop().await;
}

#[tokio::test]
async fn test_command_with_spoofed_sender_rejected() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    owner.update_input(InputDiscovery::new("home", "pub1", "node1", "switch", "0"));
    let received = capture_set_input(&owner);
    let sender = start(&bus, config("pub2")).await;
    settle().await;

    // signed by pub2 but claims to come from pub3
    let message = SetInputMessage {
        address: "home/pub1/node1/switch/0/$set".to_string(),
        sender: "home/pub3".to_string(),
        timestamp: chrono::Utc::now(),
        value: "on".to_string(),
    };
    sender
        .signer()
        .publish_signed(&message.address, false, &message)
        .unwrap();

    assert!(received.lock().is_empty());
    owner.stop().await;
    sender.stop().await;
}

// ============================================================================
// Forged identities
// ============================================================================

#[tokio::test]
async fn test_forged_dss_identity_rejected() {
    let bus = MemoryBus::new();
    let observer = start(&bus, config("pub2")).await;
    let victim = start(&bus, config("pub1")).await;
    settle().await;
    let genuine = observer.identity().identities().get("home/pub1").unwrap();

    // claims to be DSS-issued, but "signed" with an attacker key
    let (attacker_key, _) = iotdomain_core::generate_key_pair().unwrap();
    let forged = issue_identity(&IdentityRequest::new("home", "pub1"), Issuer::Dss(&attacker_key))
        .unwrap();
    let (forged_secret, _) = forged.key_pair().unwrap();
    let payload = serde_json::to_vec(&forged.identity).unwrap();
    let wire = SignedEnvelope::seal(&payload, "home/pub1", &forged_secret).unwrap();

    let result = observer
        .identity()
        .handle_identity_message("home/pub1/$identity", &wire);
    assert!(matches!(result, Err(PublisherError::UntrustedIssuer(_))));

    // the same message through the bus leaves the cache unchanged
    bus.publish("home/pub1/$identity", true, &wire).unwrap();
    assert_eq!(observer.identity().identities().get("home/pub1"), Some(genuine));

    observer.stop().await;
    victim.stop().await;
}

#[tokio::test]
async fn test_forged_identity_rejected_once_dss_known() {
    let bus = MemoryBus::new();
    let dss = start(&bus, config("dss")).await;
    let observer = start(&bus, config("pub2")).await;
    settle().await;
    assert!(observer.identity().dss_key().is_some());

    let (attacker_key, _) = iotdomain_core::generate_key_pair().unwrap();
    let forged = issue_identity(&IdentityRequest::new("home", "pub1"), Issuer::Dss(&attacker_key))
        .unwrap();
    let (forged_secret, _) = forged.key_pair().unwrap();
    let payload = serde_json::to_vec(&forged.identity).unwrap();
    let wire = SignedEnvelope::seal(&payload, "home/pub1", &forged_secret).unwrap();

    let result = observer
        .identity()
        .handle_identity_message("home/pub1/$identity", &wire);
    assert!(matches!(result, Err(PublisherError::SignatureInvalid(_))));
    assert!(observer.identity().identities().get("home/pub1").is_none());

    dss.stop().await;
    observer.stop().await;
}

// ============================================================================
// Encrypted commands
// ============================================================================

#[tokio::test]
async fn test_encrypted_command_only_readable_by_recipient() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    owner.update_input(InputDiscovery::new("home", "pub1", "node1", "lock", "0"));
    let received = capture_set_input(&owner);
    let sender = start(&bus, config("pub2")).await;
    let bystander = start(&bus, config("pub3")).await;
    settle().await;

    sender
        .set_remote_input("home/pub1/node1/lock/0", "open", true)
        .unwrap();

    assert_eq!(received.lock().len(), 1);
    assert_eq!(received.lock()[0].value, "open");

    let sent = bus.published_matching("home/pub1/node1/lock/0/$set");
    assert_eq!(sent.len(), 1);
    assert!(!sent[0].retained);
    assert!(!sent[0].payload.contains("open"));

    let result = bystander.signer().decode(&sent[0].payload);
    assert!(matches!(result, Err(PublisherError::DecryptionFailed(_))));

    let decoded = owner.signer().decode(&sent[0].payload).unwrap();
    assert!(decoded.is_encrypted);
    assert!(decoded.is_signed);
    assert_eq!(decoded.issuer.as_deref(), Some("home/pub2"));

    owner.stop().await;
    sender.stop().await;
    bystander.stop().await;
}

#[tokio::test]
async fn test_encrypted_command_needs_known_recipient() {
    let bus = MemoryBus::new();
    let sender = start(&bus, config("pub2")).await;

    let result = sender.set_remote_input("home/nobody/node1/switch/0", "on", true);
    assert!(matches!(result, Err(PublisherError::UnknownIssuer(_))));
    assert!(bus.published_matching("home/nobody/#").is_empty());

    sender.stop().await;
}

#[tokio::test]
async fn test_configure_remote_node() {
    let bus = MemoryBus::new();
    let owner = start(&bus, config("pub1")).await;
    owner.update_node(NodeDiscovery::new("home", "pub1", "node1", "camera"));
    let configured = Arc::new(Mutex::new(None));
    let sink = configured.clone();
    owner.set_configure_handler(move |_, node, _| *sink.lock() = Some(node.clone()));
    let admin = start(&bus, config("pub2")).await;
    settle().await;

    let mut attr = BTreeMap::new();
    attr.insert("resolution".to_string(), "1080p".to_string());
    admin.configure_remote_node("home/pub1/node1", attr, true).unwrap();

    let node = configured.lock().clone().unwrap();
    assert_eq!(node.attr.get("resolution").map(String::as_str), Some("1080p"));
    assert_eq!(
        owner.nodes().get("home/pub1/node1").unwrap().attr["resolution"],
        "1080p"
    );

    owner.stop().await;
    admin.stop().await;
}

// ============================================================================
// DSS identity rotation
// ============================================================================

#[tokio::test]
async fn test_dss_rotates_identity() {
    let temp = TempDir::new().unwrap();
    let identity_file = temp.path().join("pub1.identity.json");

    let bus = MemoryBus::new();
    let dss = start(&bus, config("dss")).await;
    let publisher = start(
        &bus,
        PublisherConfig {
            identity_file: Some(identity_file.clone()),
            ..config("pub1")
        },
    )
    .await;
    settle().await;
    assert_eq!(publisher.identity().state(), IdentityState::SelfSigned);

    let dss_secret = dss.identity().signing_key().unwrap();
    let issued = issue_identity(
        &IdentityRequest::new("home", "pub1").with_organization("acme"),
        Issuer::Dss(&dss_secret),
    )
    .unwrap();
    let recipient = publisher.identity().get_publisher_key("home/pub1").unwrap();
    dss.signer()
        .publish_encrypted("home/pub1/$identity", false, &issued, &recipient)
        .unwrap();

    assert_eq!(publisher.identity().state(), IdentityState::DssIssued);
    assert_eq!(
        publisher.identity().public_identity().unwrap().public_key,
        issued.identity.public_key
    );
    assert_eq!(
        publisher.signer().public_key(),
        Some(issued.identity.key().unwrap())
    );
    settle().await;

    // the DSS accepts the new identity as announced by the publisher
    let cached = dss.identity().identities().get("home/pub1").unwrap();
    assert_eq!(cached.issuer_id, "dss");
    assert_eq!(cached.public_key, issued.identity.public_key);

    // and the rotated identity was persisted
    let saved = store::load(
        &identity_file,
        "home",
        "pub1",
        dss.identity().dss_key().as_ref(),
    )
    .unwrap();
    assert_eq!(saved.identity.public_key, issued.identity.public_key);

    dss.stop().await;
    publisher.stop().await;
}

#[tokio::test]
async fn test_dss_issued_identity_survives_restart() {
    let temp = TempDir::new().unwrap();
    let cfg = PublisherConfig {
        identity_file: Some(temp.path().join("pub1.identity.json")),
        ..config("pub1")
    };

    let bus = MemoryBus::new();
    let dss = start(&bus, config("dss")).await;
    let observer = start(&bus, config("pub2")).await;
    let publisher = start(&bus, cfg.clone()).await;
    settle().await;

    let dss_secret = dss.identity().signing_key().unwrap();
    let issued = issue_identity(&IdentityRequest::new("home", "pub1"), Issuer::Dss(&dss_secret))
        .unwrap();
    let recipient = publisher.identity().get_publisher_key("home/pub1").unwrap();
    dss.signer()
        .publish_encrypted("home/pub1/$identity", false, &issued, &recipient)
        .unwrap();
    settle().await;
    publisher.stop().await;
    drop(publisher);

    let restarted = start(&bus, cfg.clone()).await;
    settle().await;

    assert_eq!(restarted.identity().state(), IdentityState::DssIssued);
    let on_disk = store::read(cfg.identity_file.as_ref().unwrap()).unwrap();
    assert_eq!(on_disk.identity.issuer_id, "dss");
    assert_eq!(on_disk.identity.public_key, issued.identity.public_key);

    let key = issued.identity.key().unwrap();
    assert_eq!(observer.identity().get_publisher_key("home/pub1"), Some(key));
    assert_eq!(dss.identity().get_publisher_key("home/pub1"), Some(key));

    dss.stop().await;
    observer.stop().await;
    restarted.stop().await;
}

#[tokio::test]
async fn test_identity_update_from_non_dss_ignored() {
    let bus = MemoryBus::new();
    let publisher = start(&bus, config("pub1")).await;
    let impostor = start(&bus, config("pub2")).await;
    settle().await;
    let before = publisher.identity().public_identity().unwrap();

    let impostor_secret = impostor.identity().signing_key().unwrap();
    let issued =
        issue_identity(&IdentityRequest::new("home", "pub1"), Issuer::Dss(&impostor_secret))
            .unwrap();
    let recipient = publisher.identity().get_publisher_key("home/pub1").unwrap();
    impostor
        .signer()
        .publish_encrypted("home/pub1/$identity", false, &issued, &recipient)
        .unwrap();

    assert_eq!(publisher.identity().state(), IdentityState::SelfSigned);
    assert_eq!(publisher.identity().public_identity().unwrap(), before);

    publisher.stop().await;
    impostor.stop().await;
}

#[tokio::test]
async fn test_identity_file_reused_across_restarts() {
    let temp = TempDir::new().unwrap();
    let identity_file = temp.path().join("identity.json");
    let cfg = PublisherConfig {
        identity_file: Some(identity_file.clone()),
        ..config("pub1")
    };

    let bus = MemoryBus::new();
    let first = Publisher::new(cfg.clone(), bus.clone()).unwrap();
    let key = first.identity().public_identity().unwrap().public_key;
    drop(first);

    let second = Publisher::new(cfg, bus).unwrap();
    assert_eq!(second.identity().public_identity().unwrap().public_key, key);
}

// ============================================================================
// Runtime loop
// ============================================================================

#[tokio::test]
async fn test_loop_republishes_after_discovery_interval() {
    let bus = MemoryBus::new();
    let publisher = Publisher::new(
        PublisherConfig {
            discovery_interval_secs: 0,
            ..config("pub1")
        },
        bus.clone(),
    )
    .unwrap();
    publisher.update_node(NodeDiscovery::new("home", "pub1", "node1", "sensor"));

    publisher.start().await.unwrap();
    settle().await;
    tokio::time::timeout(Duration::from_secs(1), publisher.stop())
        .await
        .unwrap();

    assert!(bus.published_matching("home/pub1/$identity").len() > 1);
    assert!(bus.published_matching("home/pub1/node1/$node").len() > 1);
}

#[tokio::test]
async fn test_restart_after_stop() {
    let bus = MemoryBus::new();
    let publisher = start(&bus, config("pub1")).await;
    publisher.stop().await;
    publisher.start().await.unwrap();
    assert!(publisher.is_running());
    publisher.stop().await;
}

#[tokio::test]
async fn test_signer_shared_with_bare_message_signer() {
    // a bare signer with the publisher's resolver decodes what it publishes
    let bus = MemoryBus::new();
    let publisher = start(&bus, config("pub1")).await;
    settle().await;

    let identity = publisher.identity().clone();
    let reader = MessageSigner::new(
        bus.clone(),
        "home/reader",
        None,
        Arc::new(move |address: &str| identity.get_publisher_key(address)),
    );
    let wire = bus.retained("home/pub1/$identity").unwrap();
    let decoded = reader.decode(&wire).unwrap();
    assert!(decoded.is_signed);
    assert_eq!(decoded.issuer.as_deref(), Some("home/pub1"));

    publisher.stop().await;
}
