//! End-to-end tests for the encryption engine.
//!
//! Two or more engines talk through the in-memory transport; persistence
//! tests use real directories from `tempfile`.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use snaptalker_e2ee::{
    AppStorage, CryptoError, DirStorage, EncryptionEngine, EncryptionStatus, EngineConfig,
    Keychain, MemoryKeychain, MemoryStorage, MemoryTransport, OutgoingEnvelope, SendOutcome,
    DECRYPTION_FAILED_PLACEHOLDER,
};

fn small_config() -> EngineConfig {
    EngineConfig {
        one_time_prekey_count: 10,
        replenish_threshold: 2,
        ..EngineConfig::default()
    }
}

async fn start_with(
    user: &str,
    keychain: Arc<dyn Keychain>,
    storage: Arc<dyn AppStorage>,
    transport: &Arc<MemoryTransport>,
) -> EncryptionEngine {
    EncryptionEngine::start(user, small_config(), keychain, storage, transport.clone())
        .await
        .expect("engine should start")
}

async fn start(user: &str, transport: &Arc<MemoryTransport>) -> EncryptionEngine {
    start_with(
        user,
        Arc::new(MemoryKeychain::new()),
        Arc::new(MemoryStorage::new()),
        transport,
    )
    .await
}

async fn send(from: &EncryptionEngine, to: &EncryptionEngine, text: &str) -> String {
    let envelope = from.encrypt_message(to.user_id(), text).await.unwrap();
    // go through the wire format
    let envelope = OutgoingEnvelope::from_json(&envelope.to_json().unwrap()).unwrap();
    to.decrypt_message(from.user_id(), &envelope)
        .await
        .unwrap()
        .text()
        .to_string()
}

// ── Conversation ─────────────────────────────────────────────────────

#[tokio::test]
async fn conversation_in_both_directions() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;

    assert_eq!(send(&alice, &bob, "hello bob").await, "hello bob");
    assert_eq!(send(&bob, &alice, "hi alice").await, "hi alice");
    assert_eq!(send(&alice, &bob, "").await, "");
    assert_eq!(send(&alice, &bob, "ünïcödé ✓").await, "ünïcödé ✓");

    assert_eq!(alice.active_contacts(), vec!["bob"]);
    assert_eq!(bob.active_contacts(), vec!["alice"]);
}

#[tokio::test]
async fn safety_numbers_agree() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    send(&alice, &bob, "hi").await;

    let from_alice = alice.safety_number("bob").unwrap();
    let from_bob = bob.safety_number("alice").unwrap();
    assert_eq!(from_alice, from_bob);
    assert_eq!(from_alice.split(' ').count(), 12);
    assert!(bob.verify_safety_number("alice", &from_alice.replace(' ', "")).unwrap());

    assert!(matches!(
        alice.safety_number("stranger"),
        Err(CryptoError::SessionError(_))
    ));
}

#[tokio::test]
async fn tampered_message_shows_placeholder_and_session_continues() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    send(&alice, &bob, "first").await;

    let mut envelope = alice.encrypt_message("bob", "second").await.unwrap();
    let mut raw = BASE64.decode(&envelope.message.ciphertext).unwrap();
    raw[0] ^= 0x01;
    let original = std::mem::replace(&mut envelope.message.ciphertext, BASE64.encode(&raw));

    let shown = bob.decrypt_message("alice", &envelope).await.unwrap();
    assert!(shown.is_placeholder());
    assert_eq!(shown.text(), DECRYPTION_FAILED_PLACEHOLDER);

    envelope.message.ciphertext = original;
    let shown = bob.decrypt_message("alice", &envelope).await.unwrap();
    assert_eq!(shown.text(), "second");
}

#[tokio::test]
async fn message_without_session_is_placeholder() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    let carol = start("carol", &transport).await;

    send(&alice, &bob, "establish").await;
    let envelope = alice.encrypt_message("bob", "for bob").await.unwrap();

    // carol never talked to alice
    let shown = carol.decrypt_message("alice", &envelope).await.unwrap();
    assert!(shown.is_placeholder());
}

// ── Handshake ────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_get_session_runs_one_handshake() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    start("bob", &transport).await;
    let published = transport.remaining_one_time_prekeys("bob");

    let (a, b, c) = tokio::join!(
        alice.get_session("bob"),
        alice.get_session("bob"),
        alice.get_session("bob"),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert_eq!(transport.fetch_count(), 1);
    assert_eq!(transport.remaining_one_time_prekeys("bob"), published - 1);
    assert!(!alice.is_establishing("bob"));
}

#[tokio::test]
async fn each_handshake_uses_a_fresh_one_time_prekey() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;

    let first = alice.encrypt_message("bob", "one").await.unwrap();
    alice.create_session("bob").await.unwrap();
    let second = alice.encrypt_message("bob", "two").await.unwrap();

    let first_header = first.header.clone().unwrap();
    let second_header = second.header.clone().unwrap();
    assert!(first_header.one_time_pre_key_id.is_some());
    assert_ne!(
        first_header.one_time_pre_key_id,
        second_header.one_time_pre_key_id
    );
    assert_ne!(first_header.ephemeral_key, second_header.ephemeral_key);

    // the newer handshake replaces the older session on bob's side
    assert_eq!(bob.decrypt_message("alice", &first).await.unwrap().text(), "one");
    assert_eq!(bob.decrypt_message("alice", &second).await.unwrap().text(), "two");
}

#[tokio::test]
async fn exhausted_peer_still_reachable_with_reduced_forward_secrecy() {
    let transport = Arc::new(MemoryTransport::new());
    let bob = EncryptionEngine::start(
        "bob",
        EngineConfig {
            one_time_prekey_count: 1,
            replenish_threshold: 0,
            ..EngineConfig::default()
        },
        Arc::new(MemoryKeychain::new()),
        Arc::new(MemoryStorage::new()),
        transport.clone(),
    )
    .await
    .unwrap();
    let alice = start("alice", &transport).await;
    let carol = start("carol", &transport).await;

    send(&alice, &bob, "took the last prekey").await;
    let envelope = carol.encrypt_message("bob", "no prekey left").await.unwrap();
    assert_eq!(envelope.header.as_ref().unwrap().one_time_pre_key_id, None);
    assert_eq!(
        bob.decrypt_message("carol", &envelope).await.unwrap().text(),
        "no prekey left"
    );

    assert!(carol.has_reduced_forward_secrecy("bob").unwrap());
    assert!(bob.has_reduced_forward_secrecy("carol").unwrap());
    assert!(!alice.has_reduced_forward_secrecy("bob").unwrap());
    assert!(!bob.has_reduced_forward_secrecy("alice").unwrap());
    assert!(matches!(
        alice.has_reduced_forward_secrecy("carol"),
        Err(CryptoError::SessionError(_))
    ));
}

#[tokio::test]
async fn replayed_handshake_cannot_roll_back_session() {
    let transport = Arc::new(MemoryTransport::new());
    let bob = EncryptionEngine::start(
        "bob",
        EngineConfig {
            one_time_prekey_count: 1,
            replenish_threshold: 0,
            ..EngineConfig::default()
        },
        Arc::new(MemoryKeychain::new()),
        Arc::new(MemoryStorage::new()),
        transport.clone(),
    )
    .await
    .unwrap();
    let alice = start("alice", &transport).await;
    let carol = start("carol", &transport).await;
    // carol takes the only one-time prekey, so alice's handshakes run without one
    carol.get_session("bob").await.unwrap();

    let first = alice.encrypt_message("bob", "m1").await.unwrap();
    assert_eq!(first.header.as_ref().unwrap().one_time_pre_key_id, None);
    assert_eq!(bob.decrypt_message("alice", &first).await.unwrap().text(), "m1");

    alice.create_session("bob").await.unwrap();
    let second = alice.encrypt_message("bob", "m2").await.unwrap();
    assert_eq!(bob.decrypt_message("alice", &second).await.unwrap().text(), "m2");

    let replay = bob.decrypt_message("alice", &first).await.unwrap();
    assert!(replay.is_placeholder());
    assert!(matches!(
        bob.accept_session(first.header.as_ref().unwrap()).await,
        Err(CryptoError::HandshakeFailure(_))
    ));

    // bob is still on the second session
    assert_eq!(send(&alice, &bob, "m3").await, "m3");
}

#[tokio::test]
async fn header_naming_a_spent_prekey_is_placeholder() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;

    let first = alice.encrypt_message("bob", "one").await.unwrap();
    bob.decrypt_message("alice", &first).await.unwrap();
    let spent = first.header.as_ref().unwrap().one_time_pre_key_id;
    assert!(spent.is_some());

    alice.create_session("bob").await.unwrap();
    let mut second = alice.encrypt_message("bob", "two").await.unwrap();
    second.header.as_mut().unwrap().one_time_pre_key_id = spent;

    let shown = bob.decrypt_message("alice", &second).await.unwrap();
    assert!(shown.is_placeholder());
}

#[tokio::test]
async fn unknown_peer_is_a_transport_error() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    assert!(matches!(
        alice.encrypt_message("nobody", "hello?").await,
        Err(CryptoError::Transport(_))
    ));
}

// ── Persistence ──────────────────────────────────────────────────────

#[tokio::test]
async fn session_survives_restart_on_disk() {
    let dir = tempfile::TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let keychain: Arc<dyn Keychain> = Arc::new(MemoryKeychain::new());
    let bob = start("bob", &transport).await;

    let public_key = {
        let storage = Arc::new(DirStorage::open(dir.path()).unwrap());
        let alice = start_with("alice", keychain.clone(), storage, &transport).await;
        send(&alice, &bob, "before restart").await;
        send(&bob, &alice, "reply").await;
        let key = alice.identity_public_key().unwrap();
        alice.shutdown();
        key
    };

    let storage = Arc::new(DirStorage::open(dir.path()).unwrap());
    let alice = start_with("alice", keychain, storage.clone(), &transport).await;
    assert_eq!(alice.identity_public_key().unwrap(), public_key);

    // no new handshake: the session and its counters came back from disk
    let envelope = alice.encrypt_message("bob", "after restart").await.unwrap();
    assert!(envelope.header.is_none());
    assert_eq!(envelope.message.message_number, 2);
    assert_eq!(
        bob.decrypt_message("alice", &envelope).await.unwrap().text(),
        "after restart"
    );

    // storage holds counters, never keys
    let record = storage.get("session_alice_bob").unwrap().unwrap();
    let record: serde_json::Value = serde_json::from_slice(&record).unwrap();
    assert_eq!(record["ownerId"], "alice");
    assert!(record.get("rootKey").is_none());
    assert!(storage.get("x3dh_ad_alice_bob").unwrap().is_some());
}

#[tokio::test]
async fn remove_session_forces_new_handshake() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    send(&alice, &bob, "hi").await;

    alice.remove_session("bob").unwrap();
    assert!(alice.active_contacts().is_empty());

    let envelope = alice.encrypt_message("bob", "new session").await.unwrap();
    assert!(envelope.header.is_some());
    assert_eq!(
        bob.decrypt_message("alice", &envelope).await.unwrap().text(),
        "new session"
    );
}

// ── Backup ───────────────────────────────────────────────────────────

#[tokio::test]
async fn backup_restores_identity_and_sessions() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    send(&alice, &bob, "before backup").await;

    let blob = alice.export_backup("hunter2 hunter2").await.unwrap();
    let json = blob.to_json().unwrap();
    assert!(!json.contains(&alice.identity_public_key().unwrap()));
    let original_key = alice.identity_public_key().unwrap();
    alice.shutdown();

    // a new device
    let restored = start("alice", &transport).await;
    assert_ne!(restored.identity_public_key().unwrap(), original_key);

    let blob = snaptalker_e2ee::BackupBlob::from_json(&json).unwrap();
    restored.import_backup(&blob, "hunter2 hunter2").await.unwrap();
    assert_eq!(restored.identity_public_key().unwrap(), original_key);

    let envelope = restored.encrypt_message("bob", "from restored").await.unwrap();
    assert!(envelope.header.is_none());
    assert_eq!(
        bob.decrypt_message("alice", &envelope).await.unwrap().text(),
        "from restored"
    );
}

#[tokio::test]
async fn backup_with_wrong_passphrase_is_rejected() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let blob = alice.export_backup("correct").await.unwrap();
    let before = alice.identity_public_key().unwrap();

    assert!(matches!(
        alice.import_backup(&blob, "incorrect").await,
        Err(CryptoError::DecryptionFailed(_))
    ));
    assert_eq!(alice.identity_public_key().unwrap(), before);

    let bob = start("bob", &transport).await;
    assert!(matches!(
        bob.import_backup(&blob, "correct").await,
        Err(CryptoError::Backup(_))
    ));
}

// ── Offline queue ────────────────────────────────────────────────────

#[tokio::test]
async fn queued_message_is_delivered_when_back_online() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;

    transport.set_offline(true);
    let outcome = alice.send_message("bob", "while offline").await.unwrap();
    let SendOutcome::Queued(id) = outcome else {
        panic!("expected the message to be queued");
    };
    assert_eq!(alice.pending_messages().len(), 1);

    transport.set_offline(false);
    let report = alice.process_queue().await.unwrap();
    assert_eq!(report.delivered, vec![id]);
    assert!(alice.pending_messages().is_empty());

    let inbox = transport.take_inbox("bob");
    assert_eq!(inbox.len(), 1);
    let envelope = OutgoingEnvelope::from_json(&inbox[0]).unwrap();
    assert_eq!(
        bob.decrypt_message("alice", &envelope).await.unwrap().text(),
        "while offline"
    );
}

#[tokio::test]
async fn queue_gives_up_after_five_attempts() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    transport.set_offline(true);
    let id = alice.queue_message("bob", "payload".into()).unwrap();

    for attempt in 1..5u32 {
        let report = alice.process_queue().await.unwrap();
        assert_eq!(report.retrying, vec![(id.clone(), attempt)]);
        assert!(report.failed.is_empty());
    }

    let report = alice.process_queue().await.unwrap();
    assert!(matches!(
        report.failed.as_slice(),
        [CryptoError::QueueOverflow { attempts: 5, .. }]
    ));

    // nothing left for a sixth attempt
    let report = alice.process_queue().await.unwrap();
    assert!(report.retrying.is_empty() && report.failed.is_empty());
    assert!(alice.pending_messages().is_empty());
}

#[tokio::test]
async fn queue_survives_restart() {
    let transport = Arc::new(MemoryTransport::new());
    let keychain: Arc<dyn Keychain> = Arc::new(MemoryKeychain::new());
    let storage: Arc<dyn AppStorage> = Arc::new(MemoryStorage::new());

    let alice = start_with("alice", keychain.clone(), storage.clone(), &transport).await;
    alice.queue_message("bob", "later".into()).unwrap();
    alice.shutdown();

    let alice = start_with("alice", keychain, storage, &transport).await;
    let pending = alice.pending_messages();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].payload, "later");
}

// ── Engine state ─────────────────────────────────────────────────────

#[tokio::test]
async fn disabled_engine_refuses_to_encrypt() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    start("bob", &transport).await;

    alice.set_encryption_enabled(false).unwrap();
    assert!(matches!(alice.status(), EncryptionStatus::Disabled { .. }));
    assert!(matches!(
        alice.encrypt_message("bob", "plain?").await,
        Err(CryptoError::Disabled)
    ));
    assert!(matches!(
        alice.send_message("bob", "plain?").await,
        Err(CryptoError::Disabled)
    ));
    assert!(transport.take_inbox("bob").is_empty());
}

#[tokio::test]
async fn shutdown_drops_keys() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    start("bob", &transport).await;
    alice.get_session("bob").await.unwrap();

    alice.shutdown();
    assert!(alice.active_contacts().is_empty());
    assert!(matches!(alice.identity_public_key(), Err(CryptoError::Disabled)));
    assert!(matches!(
        alice.get_session("bob").await,
        Err(CryptoError::Disabled)
    ));
}

#[tokio::test]
async fn reset_keys_starts_over() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    send(&alice, &bob, "hi").await;
    let old_number = alice.safety_number("bob").unwrap();
    let old_key = alice.identity_public_key().unwrap();

    alice.reset_keys().await.unwrap();
    assert_ne!(alice.identity_public_key().unwrap(), old_key);
    assert!(alice.active_contacts().is_empty());

    // bob picks up the new identity through the new handshake
    assert_eq!(send(&alice, &bob, "new keys").await, "new keys");
    assert_ne!(alice.safety_number("bob").unwrap(), old_number);
    assert_eq!(
        alice.safety_number("bob").unwrap(),
        bob.safety_number("alice").unwrap()
    );
}

#[tokio::test]
async fn safety_numbers_follow_a_peer_who_reset_keys() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = start("alice", &transport).await;
    let bob = start("bob", &transport).await;
    // bob caches alice's bundle by initiating
    send(&bob, &alice, "hi").await;
    let old_number = bob.safety_number("alice").unwrap();

    alice.reset_keys().await.unwrap();
    assert_eq!(send(&alice, &bob, "new keys").await, "new keys");

    assert_ne!(bob.safety_number("alice").unwrap(), old_number);
    assert_eq!(
        alice.safety_number("bob").unwrap(),
        bob.safety_number("alice").unwrap()
    );
}

#[tokio::test]
async fn invalid_config_is_rejected_at_start() {
    let transport = Arc::new(MemoryTransport::new());
    let result = EncryptionEngine::start(
        "alice",
        EngineConfig {
            backup_iterations: 10,
            ..EngineConfig::default()
        },
        Arc::new(MemoryKeychain::new()),
        Arc::new(MemoryStorage::new()),
        transport,
    )
    .await;
    assert!(result.is_err());
}
