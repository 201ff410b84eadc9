//! Two local accounts talking through an in-memory key server.
//!
//! ```bash
//! RUST_LOG=snaptalker_e2ee=debug cargo run -p snaptalker-e2ee --bin e2ee-demo
//! ```

use std::sync::Arc;

use snaptalker_e2ee::{
    CryptoError, EncryptionEngine, EngineConfig, MemoryKeychain, MemoryStorage, MemoryTransport,
    OutgoingEnvelope, SendOutcome,
};
use tracing_subscriber::EnvFilter;

async fn login(user: &str, transport: &Arc<MemoryTransport>) -> Result<EncryptionEngine, CryptoError> {
    EncryptionEngine::start(
        user,
        EngineConfig::default(),
        Arc::new(MemoryKeychain::new()),
        Arc::new(MemoryStorage::new()),
        transport.clone(),
    )
    .await
}

async fn read_inbox(
    engine: &EncryptionEngine,
    transport: &MemoryTransport,
) -> Result<(), CryptoError> {
    for payload in transport.take_inbox(engine.user_id()) {
        let envelope = OutgoingEnvelope::from_json(&payload)?;
        let message = engine.decrypt_message(&envelope.sender_id, &envelope).await?;
        tracing::info!(to = engine.user_id(), from = %envelope.sender_id, text = message.text(), "received");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), CryptoError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let transport = Arc::new(MemoryTransport::new());
    let alice = login("alice", &transport).await?;
    let bob = login("bob", &transport).await?;

    alice.send_message("bob", "hi bob").await?;
    read_inbox(&bob, &transport).await?;

    bob.send_message("alice", "hi alice").await?;
    read_inbox(&alice, &transport).await?;

    tracing::info!(number = %alice.safety_number("bob")?, "alice sees safety number");
    tracing::info!(number = %bob.safety_number("alice")?, "bob sees safety number");

    transport.set_offline(true);
    if let SendOutcome::Queued(id) = alice.send_message("bob", "sent while offline").await? {
        tracing::info!(id = %id, "network down, message queued");
    }
    transport.set_offline(false);
    let report = alice.process_queue().await?;
    tracing::info!(delivered = report.delivered.len(), "queue flushed");
    read_inbox(&bob, &transport).await?;

    alice.shutdown();
    bob.shutdown();
    Ok(())
}
