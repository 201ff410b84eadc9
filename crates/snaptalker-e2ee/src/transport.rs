//! The network collaborator seam.
//!
//! The engine never speaks HTTP itself. Hosts implement [`KeyTransport`] over
//! their REST/WebSocket layer; [`MemoryTransport`] is an in-process stand-in
//! that behaves like a key server plus mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::bundle::KeyBundle;
use crate::error::CryptoError;
use crate::prekeys::PublishedKeyBundle;

#[async_trait]
pub trait KeyTransport: Send + Sync {
    /// Upload our public bundle.
    async fn publish_bundle(&self, user_id: &str, bundle: PublishedKeyBundle) -> Result<(), CryptoError>;

    /// Fetch a peer's bundle. The server attaches at most one one-time prekey
    /// and never hands the same one out twice.
    async fn fetch_bundle(&self, user_id: &str) -> Result<KeyBundle, CryptoError>;

    /// Hand an opaque payload to the delivery path.
    async fn deliver(&self, destination: &str, payload: &str) -> Result<(), CryptoError>;
}

#[derive(Default)]
pub struct MemoryTransport {
    bundles: Mutex<HashMap<String, PublishedKeyBundle>>,
    inboxes: Mutex<HashMap<String, Vec<String>>>,
    offline: AtomicBool,
    fetches: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every `deliver` fails.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Drain the payloads delivered to `user_id`.
    pub fn take_inbox(&self, user_id: &str) -> Vec<String> {
        self.inboxes.lock().remove(user_id).unwrap_or_default()
    }

    /// Number of successful `fetch_bundle` calls.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn remaining_one_time_prekeys(&self, user_id: &str) -> usize {
        self.bundles
            .lock()
            .get(user_id)
            .map_or(0, |b| b.one_time_pre_keys.len())
    }
}

#[async_trait]
impl KeyTransport for MemoryTransport {
    async fn publish_bundle(&self, user_id: &str, bundle: PublishedKeyBundle) -> Result<(), CryptoError> {
        tracing::debug!(
            user = %user_id,
            one_time = bundle.one_time_pre_keys.len(),
            "bundle published"
        );
        self.bundles.lock().insert(user_id.to_string(), bundle);
        Ok(())
    }

    async fn fetch_bundle(&self, user_id: &str) -> Result<KeyBundle, CryptoError> {
        let mut bundles = self.bundles.lock();
        let published = bundles
            .get_mut(user_id)
            .ok_or_else(|| CryptoError::Transport(format!("no bundle published for {user_id}")))?;

        let one_time = if published.one_time_pre_keys.is_empty() {
            None
        } else {
            Some(published.one_time_pre_keys.remove(0))
        };
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(KeyBundle::from_published(user_id, published, one_time))
    }

    async fn deliver(&self, destination: &str, payload: &str) -> Result<(), CryptoError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CryptoError::Transport(format!("{destination} unreachable")));
        }
        self.inboxes
            .lock()
            .entry(destination.to_string())
            .or_default()
            .push(payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::keychain::MemoryKeychain;
    use crate::prekeys::PreKeyFactory;
    use std::sync::Arc;

    #[tokio::test]
    async fn one_time_prekeys_are_handed_out_once() {
        let transport = MemoryTransport::new();
        let identity = Identity::generate().unwrap();
        let published = PreKeyFactory::new(Arc::new(MemoryKeychain::new()))
            .generate_key_bundle(&identity, 2)
            .unwrap();
        transport.publish_bundle("bob", published).await.unwrap();

        let first = transport.fetch_bundle("bob").await.unwrap();
        let second = transport.fetch_bundle("bob").await.unwrap();
        let third = transport.fetch_bundle("bob").await.unwrap();

        assert_ne!(
            first.one_time_pre_key.unwrap().id,
            second.one_time_pre_key.unwrap().id
        );
        assert!(third.one_time_pre_key.is_none());
        assert_eq!(transport.fetch_count(), 3);
    }

    #[tokio::test]
    async fn offline_delivery_fails() {
        let transport = MemoryTransport::new();
        transport.set_offline(true);
        assert!(matches!(
            transport.deliver("bob", "x").await,
            Err(CryptoError::Transport(_))
        ));

        transport.set_offline(false);
        transport.deliver("bob", "x").await.unwrap();
        assert_eq!(transport.take_inbox("bob"), vec!["x".to_string()]);
        assert!(transport.take_inbox("bob").is_empty());
        assert!(matches!(
            transport.fetch_bundle("nobody").await,
            Err(CryptoError::Transport(_))
        ));
    }
}
