//! Durable outbound queue with a bounded retry budget.
//!
//! The queue never touches the network. Callers hand a message to their
//! transport and report back with [`OfflineMessageQueue::dequeue`] on success
//! or [`OfflineMessageQueue::increment_attempt`] on failure.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::prekeys::unix_millis;
use crate::rng::random_bytes;
use crate::storage::{get_json, put_json, AppStorage};

pub const QUEUE_STORAGE_KEY: &str = "offline_message_queue";

/// A message is dropped once it has failed this many times.
pub const MAX_DELIVERY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub payload: String,
    pub destination: String,
    pub enqueued_at: u64,
    pub attempts: u32,
}

impl QueuedMessage {
    pub fn new(destination: &str, payload: String) -> Result<Self, CryptoError> {
        Ok(Self {
            id: hex::encode(random_bytes::<16>()?),
            payload,
            destination: destination.to_string(),
            enqueued_at: unix_millis(),
            attempts: 0,
        })
    }
}

/// Outcome of a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStatus {
    /// Still queued; carries the number of failed attempts so far.
    Retry(u32),
    /// Budget spent. The message has been removed.
    Exhausted(QueuedMessage),
}

pub struct OfflineMessageQueue {
    storage: Arc<dyn AppStorage>,
    messages: Vec<QueuedMessage>,
    max_attempts: u32,
}

impl OfflineMessageQueue {
    pub fn new(storage: Arc<dyn AppStorage>, max_attempts: u32) -> Self {
        Self {
            storage,
            messages: Vec::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Replace the in-memory queue with what storage holds.
    pub fn load(&mut self) -> Result<(), CryptoError> {
        self.messages = get_json(self.storage.as_ref(), QUEUE_STORAGE_KEY)?.unwrap_or_default();
        if !self.messages.is_empty() {
            tracing::debug!(count = self.messages.len(), "restored offline message queue");
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), CryptoError> {
        put_json(self.storage.as_ref(), QUEUE_STORAGE_KEY, &self.messages)
    }

    /// Append a message with its attempt counter reset. A message whose id is
    /// already queued is replaced in place.
    pub fn enqueue(&mut self, mut message: QueuedMessage) -> Result<(), CryptoError> {
        message.attempts = 0;
        match self.messages.iter_mut().find(|m| m.id == message.id) {
            Some(existing) => *existing = message,
            None => self.messages.push(message),
        }
        self.persist()
    }

    /// Queued messages, oldest first.
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove a delivered message. Returns it if it was queued.
    pub fn dequeue(&mut self, id: &str) -> Result<Option<QueuedMessage>, CryptoError> {
        let Some(pos) = self.messages.iter().position(|m| m.id == id) else {
            return Ok(None);
        };
        let message = self.messages.remove(pos);
        self.persist()?;
        Ok(Some(message))
    }

    /// Record a failed delivery. `None` if the id is not queued.
    pub fn increment_attempt(&mut self, id: &str) -> Result<Option<RetryStatus>, CryptoError> {
        let Some(pos) = self.messages.iter().position(|m| m.id == id) else {
            return Ok(None);
        };

        self.messages[pos].attempts += 1;
        let attempts = self.messages[pos].attempts;
        let status = if attempts >= self.max_attempts {
            let message = self.messages.remove(pos);
            tracing::warn!(
                id = %message.id,
                to = %message.destination,
                attempts,
                "queued message exceeded max delivery attempts, dropping"
            );
            RetryStatus::Exhausted(message)
        } else {
            RetryStatus::Retry(attempts)
        };

        self.persist()?;
        Ok(Some(status))
    }

    pub fn clear(&mut self) -> Result<(), CryptoError> {
        self.messages.clear();
        self.storage.remove(QUEUE_STORAGE_KEY)
    }
}
