//! The per-login encryption service.
//!
//! [`EncryptionEngine`] owns the account's keys, the per-contact sessions and
//! the offline queue. It is built once at login with
//! [`EncryptionEngine::start`], shared behind an `Arc`, and torn down with
//! [`EncryptionEngine::shutdown`].
//!
//! Locking: the session map and bundle cache sit behind `parking_lot`
//! mutexes that are never held across an `.await`. Each session has its own
//! `tokio` mutex, and each contact has an establishment lock so concurrent
//! callers share one handshake. There is at most one handle per contact; a
//! new handshake swaps the contents of the existing handle under its lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use zeroize::Zeroizing;

use crate::backup::{decrypt_backup, encrypt_backup, BackupBlob, BackupContents, BackupPreKey, BackupSession};
use crate::bundle::{decode_key, KeyBundleManager};
use crate::config::EngineConfig;
use crate::error::CryptoError;
use crate::identity::{Identity, IdentityKeyStore};
use crate::keychain::Keychain;
use crate::prekeys::{unix_millis, PreKeyFactory};
use crate::queue::{OfflineMessageQueue, QueuedMessage, RetryStatus};
use crate::rng::check_crypto_available;
use crate::safety;
use crate::session::{EncryptedMessage, Session, SessionState};
use crate::storage::{get_json, put_json, AppStorage};
use crate::transport::KeyTransport;
use crate::x3dh::{initiate_key_agreement, respond_to_header, AssociatedData, EphemeralKeyPair, HandshakeHeader};

/// Shown in place of a message that could not be decrypted.
pub const DECRYPTION_FAILED_PLACEHOLDER: &str = "[Decryption failed]";

const ENCRYPTION_ENABLED_KEY: &str = "encryption_enabled";

pub fn handshake_storage_key(owner_id: &str, contact_id: &str) -> String {
    format!("x3dh_ad_{owner_id}_{contact_id}")
}

/// Initiator ephemeral keys we have already accepted from a contact.
pub fn accepted_handshakes_key(owner_id: &str, contact_id: &str) -> String {
    format!("x3dh_accepted_{owner_id}_{contact_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionStatus {
    Enabled,
    /// Encryption is off. Messages are refused, never sent in the clear.
    Disabled { reason: String },
}

/// Associated data of a session's handshake. The initiator keeps the header
/// here until it has gone out with the first message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeRecord {
    associated_data: AssociatedData,
    #[serde(default)]
    pending_header: Option<HandshakeHeader>,
}

/// What goes over the wire for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingEnvelope {
    pub sender_id: String,
    /// Present on the first message of a session we initiated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HandshakeHeader>,
    pub message: EncryptedMessage,
}

impl OutgoingEnvelope {
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecryptedMessage {
    Plaintext(String),
    /// The message failed authentication; render [`DECRYPTION_FAILED_PLACEHOLDER`].
    Placeholder,
}

impl DecryptedMessage {
    pub fn text(&self) -> &str {
        match self {
            Self::Plaintext(text) => text,
            Self::Placeholder => DECRYPTION_FAILED_PLACEHOLDER,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Self::Placeholder)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    /// Delivery failed; the envelope waits in the offline queue under this id.
    Queued(String),
}

/// Result of one pass over the offline queue.
#[derive(Debug, Default)]
pub struct DeliveryReport {
    pub delivered: Vec<String>,
    /// Still queued, with their failed-attempt count.
    pub retrying: Vec<(String, u32)>,
    /// Dropped after exhausting the retry budget (`QueueOverflow`).
    pub failed: Vec<CryptoError>,
}

type SessionHandle = Arc<AsyncMutex<Session>>;

type EstablishmentLocks = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Held for the duration of a handshake with one contact. The map entry is
/// dropped with the last guard, so the map only holds contacts mid-handshake.
struct EstablishmentGuard<'a> {
    locks: &'a EstablishmentLocks,
    contact_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EstablishmentGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock();
        if locks
            .get(&self.contact_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.contact_id);
        }
    }
}

pub struct EncryptionEngine {
    user_id: String,
    config: EngineConfig,
    keychain: Arc<dyn Keychain>,
    storage: Arc<dyn AppStorage>,
    transport: Arc<dyn KeyTransport>,
    identity_store: IdentityKeyStore,
    prekeys: PreKeyFactory,
    identity: RwLock<Option<Arc<Identity>>>,
    status: RwLock<EncryptionStatus>,
    bundles: Mutex<KeyBundleManager>,
    queue: Mutex<OfflineMessageQueue>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    establishing: EstablishmentLocks,
}

impl EncryptionEngine {
    /// Bring the engine up for `user_id`: restore caches, create and publish
    /// keys on first login, top up the prekey pool otherwise.
    ///
    /// A host without secure randomness yields an engine in
    /// [`EncryptionStatus::Disabled`] rather than an error.
    pub async fn start(
        user_id: &str,
        config: EngineConfig,
        keychain: Arc<dyn Keychain>,
        storage: Arc<dyn AppStorage>,
        transport: Arc<dyn KeyTransport>,
    ) -> Result<Self, CryptoError> {
        config.validate()?;

        let engine = Self {
            user_id: user_id.to_string(),
            identity_store: IdentityKeyStore::new(keychain.clone()),
            prekeys: PreKeyFactory::new(keychain.clone()),
            bundles: Mutex::new(KeyBundleManager::new(storage.clone(), config.max_bundle_age())),
            queue: Mutex::new(OfflineMessageQueue::new(
                storage.clone(),
                config.max_delivery_attempts,
            )),
            config,
            keychain,
            storage,
            transport,
            identity: RwLock::new(None),
            status: RwLock::new(EncryptionStatus::Enabled),
            sessions: Mutex::new(HashMap::new()),
            establishing: Mutex::new(HashMap::new()),
        };

        engine.bundles.lock().load()?;
        engine.queue.lock().load()?;

        match engine.initialize_keys().await {
            Ok(()) => {}
            Err(CryptoError::CryptoUnavailable(reason)) => {
                tracing::warn!(error = %reason, "secure random source unavailable, E2E encryption disabled");
                *engine.status.write() = EncryptionStatus::Disabled { reason };
                return Ok(engine);
            }
            Err(e) => return Err(e),
        }

        if get_json::<bool>(engine.storage.as_ref(), ENCRYPTION_ENABLED_KEY)? == Some(false) {
            *engine.status.write() = EncryptionStatus::Disabled {
                reason: "turned off by user".into(),
            };
        }

        tracing::info!(user = %engine.user_id, "encryption engine started");
        Ok(engine)
    }

    async fn initialize_keys(&self) -> Result<(), CryptoError> {
        check_crypto_available()?;

        let (identity, created) = self.identity_store.ensure_identity(&self.user_id)?;
        if created {
            // prekeys signed by a previous identity are useless now
            self.prekeys.delete_all()?;
        }
        let needs_bundle = created || self.prekeys.current_signed_prekey()?.is_none();
        *self.identity.write() = Some(Arc::new(identity));

        if needs_bundle {
            let identity = self.identity()?;
            let bundle = self
                .prekeys
                .generate_key_bundle(&identity, self.config.one_time_prekey_count)?;
            if let Err(e) = self.transport.publish_bundle(&self.user_id, bundle).await {
                tracing::warn!(error = %e, "failed to publish key bundle, call publish_keys to retry");
            }
        } else if let Err(e) = self.replenish_prekeys().await {
            tracing::warn!(error = %e, "prekey replenishment failed");
        }
        Ok(())
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn status(&self) -> EncryptionStatus {
        self.status.read().clone()
    }

    pub fn is_enabled(&self) -> bool {
        matches!(*self.status.read(), EncryptionStatus::Enabled)
    }

    fn ensure_enabled(&self) -> Result<(), CryptoError> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(CryptoError::Disabled)
        }
    }

    fn identity(&self) -> Result<Arc<Identity>, CryptoError> {
        self.identity.read().clone().ok_or(CryptoError::Disabled)
    }

    /// Our identity public key, base64.
    pub fn identity_public_key(&self) -> Result<String, CryptoError> {
        Ok(BASE64.encode(self.identity()?.public_key_bytes()))
    }

    /// Turn encryption on or off. The choice is persisted. Turning it on
    /// fails with `Disabled` if no identity could be created at startup.
    pub fn set_encryption_enabled(&self, enabled: bool) -> Result<(), CryptoError> {
        if enabled && self.identity.read().is_none() {
            return Err(CryptoError::Disabled);
        }
        put_json(self.storage.as_ref(), ENCRYPTION_ENABLED_KEY, &enabled)?;
        *self.status.write() = if enabled {
            EncryptionStatus::Enabled
        } else {
            EncryptionStatus::Disabled {
                reason: "turned off by user".into(),
            }
        };
        tracing::info!(enabled, "encryption toggled");
        Ok(())
    }

    /// Upload the bundle rebuilt from the keys currently in the keychain.
    pub async fn publish_keys(&self) -> Result<(), CryptoError> {
        let identity = self.identity()?;
        let bundle = self
            .prekeys
            .local_bundle(&identity)?
            .ok_or_else(|| CryptoError::SessionError("no prekeys generated yet".into()))?;
        self.transport.publish_bundle(&self.user_id, bundle).await
    }

    /// Top the one-time prekey pool back up to the configured size once it
    /// drops below the threshold. Returns how many keys were generated.
    pub async fn replenish_prekeys(&self) -> Result<u32, CryptoError> {
        let remaining = u32::try_from(self.prekeys.remaining_one_time_prekeys()?).unwrap_or(u32::MAX);
        if remaining >= self.config.replenish_threshold {
            return Ok(0);
        }

        let count = self.config.one_time_prekey_count.saturating_sub(remaining);
        self.prekeys.generate_one_time_prekeys(count)?;
        tracing::info!(generated = count, remaining, "replenished one-time prekeys");
        self.publish_keys().await?;
        Ok(count)
    }

    fn cached_session(&self, contact_id: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(contact_id).cloned()
    }

    async fn lock_establishment(&self, contact_id: &str) -> EstablishmentGuard<'_> {
        let lock = self
            .establishing
            .lock()
            .entry(contact_id.to_string())
            .or_default()
            .clone();
        EstablishmentGuard {
            locks: &self.establishing,
            contact_id: contact_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// True while a handshake with `contact_id` is in flight.
    pub fn is_establishing(&self, contact_id: &str) -> bool {
        self.establishing
            .lock()
            .get(contact_id)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    /// Cached session, or an active one restored from storage. The map stays
    /// locked from lookup to insert so a contact never gets two handles.
    fn existing_session(&self, contact_id: &str) -> Result<Option<SessionHandle>, CryptoError> {
        let mut sessions = self.sessions.lock();
        if let Some(handle) = sessions.get(contact_id) {
            return Ok(Some(handle.clone()));
        }
        let stored = Session::load_from_storage(
            &self.user_id,
            contact_id,
            self.storage.as_ref(),
            self.keychain.as_ref(),
        )?;
        match stored {
            Some(session) if session.state() == SessionState::Active => {
                let handle = Arc::new(AsyncMutex::new(session));
                sessions.insert(contact_id.to_string(), handle.clone());
                Ok(Some(handle))
            }
            _ => Ok(None),
        }
    }

    fn persist_session(
        &self,
        contact_id: &str,
        session: &Session,
        record: &HandshakeRecord,
    ) -> Result<(), CryptoError> {
        session.save_to_storage(self.storage.as_ref(), self.keychain.as_ref())?;
        put_json(
            self.storage.as_ref(),
            &handshake_storage_key(&self.user_id, contact_id),
            record,
        )
    }

    /// Make `session` the live session with `contact_id`, persisted with its
    /// handshake record.
    ///
    /// An existing handle is locked and its contents replaced, so a task still
    /// working on the old session can neither keep a second handle nor save
    /// stale keys over the new ones.
    async fn commit_session(
        &self,
        contact_id: &str,
        session: Session,
        record: &HandshakeRecord,
    ) -> Result<SessionHandle, CryptoError> {
        let current = {
            let mut sessions = self.sessions.lock();
            if let Some(handle) = sessions.get(contact_id).cloned() {
                handle
            } else {
                self.persist_session(contact_id, &session, record)?;
                let handle = Arc::new(AsyncMutex::new(session));
                sessions.insert(contact_id.to_string(), handle.clone());
                return Ok(handle);
            }
        };

        let mut live = current.lock().await;
        self.persist_session(contact_id, &session, record)?;
        *live = session;
        drop(live);
        Ok(current)
    }

    /// The session with `contact_id`, running a handshake if none exists.
    ///
    /// Concurrent callers for the same contact share one handshake.
    pub async fn get_session(&self, contact_id: &str) -> Result<SessionHandle, CryptoError> {
        self.ensure_enabled()?;
        if let Some(handle) = self.cached_session(contact_id) {
            return Ok(handle);
        }

        let _establishing = self.lock_establishment(contact_id).await;

        if let Some(handle) = self.existing_session(contact_id)? {
            return Ok(handle);
        }
        self.establish(contact_id).await
    }

    /// Run a fresh handshake with `contact_id`, replacing any current session.
    pub async fn create_session(&self, contact_id: &str) -> Result<SessionHandle, CryptoError> {
        self.ensure_enabled()?;
        let _establishing = self.lock_establishment(contact_id).await;
        self.establish(contact_id).await
    }

    /// Initiator half of the handshake. Caller holds the establishment lock.
    async fn establish(&self, contact_id: &str) -> Result<SessionHandle, CryptoError> {
        let identity = self.identity()?;
        tracing::debug!(contact = %contact_id, "fetching key bundle");
        let fetched = self.transport.fetch_bundle(contact_id).await?;

        let bundle = {
            let mut bundles = self.bundles.lock();
            bundles.store_bundle(contact_id, fetched)?;
            bundles.save()?;
            bundles.bundle_for_handshake(contact_id).ok_or_else(|| {
                CryptoError::SessionError(format!("no bundle cached for {contact_id}"))
            })?
        };
        if bundle.one_time_pre_key.is_none() && self.config.require_one_time_prekey {
            return Err(CryptoError::KeyExhaustion(contact_id.to_string()));
        }

        let ephemeral = EphemeralKeyPair::generate()?;
        let agreement = initiate_key_agreement(&identity, &ephemeral, &bundle)?;

        if let Some(id) = agreement.used_one_time_prekey_id {
            let mut bundles = self.bundles.lock();
            bundles.mark_one_time_prekey_used(contact_id, id);
            bundles.save()?;
        }

        // a record left without keys keeps counting from where it stopped
        let mut session = Session::load_from_storage(
            &self.user_id,
            contact_id,
            self.storage.as_ref(),
            self.keychain.as_ref(),
        )?
        .filter(|s| s.state() == SessionState::Uninitialized)
        .unwrap_or_else(|| Session::new(&self.user_id, contact_id));
        session.initialize(&agreement.shared_secret)?;

        let reduced_forward_secrecy = agreement.reduced_forward_secrecy();
        let record = HandshakeRecord {
            pending_header: Some(HandshakeHeader::new(&self.user_id, &agreement.associated_data)),
            associated_data: agreement.associated_data,
        };
        let handle = self.commit_session(contact_id, session, &record).await?;

        tracing::info!(contact = %contact_id, reduced_forward_secrecy, "session established");
        Ok(handle)
    }

    fn handshake_record(&self, contact_id: &str) -> Result<Option<HandshakeRecord>, CryptoError> {
        get_json(
            self.storage.as_ref(),
            &handshake_storage_key(&self.user_id, contact_id),
        )
    }

    fn accepted_ephemeral_keys(&self, contact_id: &str) -> Result<BTreeSet<String>, CryptoError> {
        Ok(get_json(
            self.storage.as_ref(),
            &accepted_handshakes_key(&self.user_id, contact_id),
        )?
        .unwrap_or_default())
    }

    /// Whether `header` belongs to a handshake we accepted before and that is
    /// no longer current. Such a header is a replay.
    fn is_spent_handshake(&self, contact_id: &str, header: &HandshakeHeader) -> Result<bool, CryptoError> {
        Ok(self
            .accepted_ephemeral_keys(contact_id)?
            .contains(&header.ephemeral_key))
    }

    /// Whether the current session with `contact_id` was agreed without a
    /// one-time prekey, so compromise of the peer's signed prekey exposes it.
    pub fn has_reduced_forward_secrecy(&self, contact_id: &str) -> Result<bool, CryptoError> {
        let record = self.handshake_record(contact_id)?.ok_or_else(|| {
            CryptoError::SessionError(format!("no session with {contact_id}"))
        })?;
        Ok(record.associated_data.responder_one_time_pre_key_id.is_none())
    }

    /// Whether `header` is the handshake our current session came from.
    fn is_current_handshake(&self, contact_id: &str, header: &HandshakeHeader) -> Result<bool, CryptoError> {
        let known = self
            .handshake_record(contact_id)?
            .is_some_and(|r| r.associated_data.initiator_ephemeral_key == header.ephemeral_key);
        Ok(known && self.existing_session(contact_id)?.is_some())
    }

    /// Responder half of the handshake, computed without side effects.
    fn responder_session(&self, header: &HandshakeHeader) -> Result<(Session, AssociatedData), CryptoError> {
        let identity = self.identity()?;
        let signed = self.prekeys.load_signed_prekey(header.signed_pre_key_id)?;
        let one_time = match header.one_time_pre_key_id {
            Some(id) => Some(self.prekeys.load_one_time_prekey(id)?.ok_or_else(|| {
                CryptoError::HandshakeFailure(format!("one-time prekey {id} already consumed"))
            })?),
            None => None,
        };

        let secret = respond_to_header(&identity, &signed, one_time.as_ref(), header)?;
        let associated_data = header.associated_data(&identity.public_key_bytes());

        let mut session = Session::new(&self.user_id, &header.initiator_id);
        session.initialize(&secret)?;
        Ok((session, associated_data))
    }

    /// Persist a responder session, remember its ephemeral key and consume
    /// its one-time prekey.
    async fn commit_responder(
        &self,
        header: &HandshakeHeader,
        session: Session,
        associated_data: AssociatedData,
    ) -> Result<(), CryptoError> {
        let contact_id = header.initiator_id.as_str();
        let record = HandshakeRecord {
            associated_data,
            pending_header: None,
        };
        self.commit_session(contact_id, session, &record).await?;

        let mut accepted = self.accepted_ephemeral_keys(contact_id)?;
        accepted.insert(header.ephemeral_key.clone());
        put_json(
            self.storage.as_ref(),
            &accepted_handshakes_key(&self.user_id, contact_id),
            &accepted,
        )?;
        if let Some(id) = header.one_time_pre_key_id {
            self.prekeys.take_one_time_prekey(id)?;
        }
        tracing::info!(
            contact = %contact_id,
            reduced_forward_secrecy = header.one_time_pre_key_id.is_none(),
            "accepted session"
        );

        if let Err(e) = self.replenish_prekeys().await {
            tracing::warn!(error = %e, "prekey replenishment failed");
        }
        Ok(())
    }

    /// Complete a handshake a peer started. A header that already produced
    /// the current session is a no-op; an older accepted one is refused.
    pub async fn accept_session(&self, header: &HandshakeHeader) -> Result<(), CryptoError> {
        self.ensure_enabled()?;
        let _establishing = self.lock_establishment(&header.initiator_id).await;

        if self.is_current_handshake(&header.initiator_id, header)? {
            return Ok(());
        }
        if self.is_spent_handshake(&header.initiator_id, header)? {
            return Err(CryptoError::HandshakeFailure(format!(
                "handshake from {} was already used",
                header.initiator_id
            )));
        }
        let (session, associated_data) = self.responder_session(header)?;
        self.commit_responder(header, session, associated_data).await
    }

    /// Encrypt `plaintext` for `contact_id`, running a handshake first if
    /// needed. Fails with `Disabled` when encryption is off.
    pub async fn encrypt_message(
        &self,
        contact_id: &str,
        plaintext: &str,
    ) -> Result<OutgoingEnvelope, CryptoError> {
        self.ensure_enabled()?;
        let handle = self.get_session(contact_id).await?;
        let mut session = handle.lock().await;

        let mut next = session.clone();
        let message = next.encrypt_outgoing(plaintext.as_bytes())?;

        let mut record = self.handshake_record(contact_id)?;
        let header = record.as_mut().and_then(|r| r.pending_header.take());

        next.save_to_storage(self.storage.as_ref(), self.keychain.as_ref())?;
        if let (Some(_), Some(record)) = (&header, &record) {
            put_json(
                self.storage.as_ref(),
                &handshake_storage_key(&self.user_id, contact_id),
                record,
            )?;
        }
        *session = next;

        Ok(OutgoingEnvelope {
            sender_id: self.user_id.clone(),
            header,
            message,
        })
    }

    /// Encrypt and hand to the transport. A delivery failure queues the
    /// envelope instead of failing.
    pub async fn send_message(&self, contact_id: &str, plaintext: &str) -> Result<SendOutcome, CryptoError> {
        let payload = self.encrypt_message(contact_id, plaintext).await?.to_json()?;
        match self.transport.deliver(contact_id, &payload).await {
            Ok(()) => Ok(SendOutcome::Delivered),
            Err(e) => {
                tracing::warn!(to = %contact_id, error = %e, "send failed, queuing for retry");
                let id = self.queue_message(contact_id, payload)?;
                Ok(SendOutcome::Queued(id))
            }
        }
    }

    /// Decrypt an envelope from `contact_id`.
    ///
    /// Authentication failures come back as [`DecryptedMessage::Placeholder`];
    /// other errors propagate.
    pub async fn decrypt_message(
        &self,
        contact_id: &str,
        envelope: &OutgoingEnvelope,
    ) -> Result<DecryptedMessage, CryptoError> {
        self.ensure_enabled()?;
        match self.open_envelope(contact_id, envelope).await {
            Ok(text) => Ok(DecryptedMessage::Plaintext(text)),
            Err(CryptoError::DecryptionFailed(reason)) => {
                tracing::warn!(contact = %contact_id, error = %reason, "failed to decrypt message");
                Ok(DecryptedMessage::Placeholder)
            }
            Err(e) => Err(e),
        }
    }

    async fn open_envelope(&self, contact_id: &str, envelope: &OutgoingEnvelope) -> Result<String, CryptoError> {
        if envelope.sender_id != contact_id {
            return Err(CryptoError::DecryptionFailed(format!(
                "envelope from {} presented as {contact_id}",
                envelope.sender_id
            )));
        }

        if let Some(header) = &envelope.header {
            if header.initiator_id != contact_id {
                return Err(CryptoError::DecryptionFailed(
                    "handshake header names a different sender".into(),
                ));
            }
            let _establishing = self.lock_establishment(contact_id).await;

            if !self.is_current_handshake(contact_id, header)? {
                if self.is_spent_handshake(contact_id, header)? {
                    return Err(CryptoError::DecryptionFailed(
                        "handshake was already used".into(),
                    ));
                }
                // an unusable header makes the message undecryptable, not the engine
                let (mut session, associated_data) =
                    self.responder_session(header).map_err(|e| match e {
                        CryptoError::HandshakeFailure(reason) => CryptoError::DecryptionFailed(reason),
                        other => other,
                    })?;
                let plaintext = session.decrypt_incoming(&envelope.message)?;
                let text = utf8(plaintext)?;
                self.commit_responder(header, session, associated_data).await?;
                return Ok(text);
            }
        }

        let handle = self.existing_session(contact_id)?.ok_or_else(|| {
            CryptoError::DecryptionFailed(format!("no session with {contact_id}"))
        })?;
        let mut session = handle.lock().await;

        let mut next = session.clone();
        let text = utf8(next.decrypt_incoming(&envelope.message)?)?;
        next.save_to_storage(self.storage.as_ref(), self.keychain.as_ref())?;
        *session = next;
        Ok(text)
    }

    /// Contacts with a session loaded in memory, sorted.
    pub fn active_contacts(&self) -> Vec<String> {
        let mut contacts: Vec<String> = self.sessions.lock().keys().cloned().collect();
        contacts.sort();
        contacts
    }

    /// Drop the session with `contact_id` from memory and storage.
    pub fn remove_session(&self, contact_id: &str) -> Result<(), CryptoError> {
        self.sessions.lock().remove(contact_id);
        Session::delete_from_storage(
            &self.user_id,
            contact_id,
            self.storage.as_ref(),
            self.keychain.as_ref(),
        )?;
        self.storage
            .remove(&handshake_storage_key(&self.user_id, contact_id))
    }

    /// The contact's identity key: from the handshake of the current session,
    /// else from the bundle cache.
    fn contact_identity_key(&self, contact_id: &str) -> Result<[u8; 32], CryptoError> {
        if let Some(record) = self.handshake_record(contact_id)? {
            let ours = self.identity_public_key()?;
            let ad = record.associated_data;
            let theirs = if ad.initiator_identity_key == ours {
                ad.responder_identity_key
            } else {
                ad.initiator_identity_key
            };
            return decode_key("contact identity key", &theirs);
        }

        let cached = self
            .bundles
            .lock()
            .get_bundle(contact_id)
            .map(|b| b.identity_key.clone())
            .ok_or_else(|| {
                CryptoError::SessionError(format!("no identity key known for {contact_id}"))
            })?;
        decode_key("contact identity key", &cached)
    }

    pub fn safety_number(&self, contact_id: &str) -> Result<String, CryptoError> {
        let identity = self.identity()?;
        let theirs = self.contact_identity_key(contact_id)?;
        Ok(safety::generate(&identity.public_key_bytes(), &theirs))
    }

    /// Compare a number read out by the contact with ours.
    pub fn verify_safety_number(&self, contact_id: &str, presented: &str) -> Result<bool, CryptoError> {
        Ok(safety::matches(&self.safety_number(contact_id)?, presented))
    }

    /// Park a payload for later delivery. Returns the queue id.
    pub fn queue_message(&self, destination: &str, payload: String) -> Result<String, CryptoError> {
        let message = QueuedMessage::new(destination, payload)?;
        let id = message.id.clone();
        self.queue.lock().enqueue(message)?;
        tracing::debug!(id = %id, to = %destination, "message queued");
        Ok(id)
    }

    pub fn pending_messages(&self) -> Vec<QueuedMessage> {
        self.queue.lock().pending()
    }

    /// Try every queued message once. Messages that hit the retry limit are
    /// dropped and reported as `QueueOverflow`.
    pub async fn process_queue(&self) -> Result<DeliveryReport, CryptoError> {
        let pending = self.queue.lock().pending();
        let mut report = DeliveryReport::default();
        if pending.is_empty() {
            return Ok(report);
        }
        tracing::debug!(count = pending.len(), "retrying queued messages");

        for message in pending {
            match self.transport.deliver(&message.destination, &message.payload).await {
                Ok(()) => {
                    self.queue.lock().dequeue(&message.id)?;
                    report.delivered.push(message.id);
                }
                Err(e) => {
                    tracing::debug!(id = %message.id, error = %e, "queued message delivery failed");
                    let status = self.queue.lock().increment_attempt(&message.id)?;
                    match status {
                        Some(RetryStatus::Retry(attempts)) => report.retrying.push((message.id, attempts)),
                        Some(RetryStatus::Exhausted(dropped)) => {
                            report.failed.push(CryptoError::QueueOverflow {
                                id: dropped.id.clone(),
                                attempts: dropped.attempts,
                            });
                        }
                        None => {}
                    }
                }
            }
        }
        Ok(report)
    }

    /// Destroy every key and session, then start over with a new identity.
    pub async fn reset_keys(&self) -> Result<(), CryptoError> {
        self.wipe_sessions()?;
        {
            let mut bundles = self.bundles.lock();
            bundles.clear();
            bundles.save()?;
        }
        self.prekeys.delete_all()?;
        self.identity_store.delete_identity(&self.user_id)?;
        *self.identity.write() = None;

        tracing::warn!(user = %self.user_id, "encryption keys reset");
        self.initialize_keys().await
    }

    fn wipe_sessions(&self) -> Result<(), CryptoError> {
        let mut contacts = Session::stored_contacts(&self.user_id, self.storage.as_ref())?;
        contacts.extend(self.sessions.lock().drain().map(|(contact, _)| contact));
        contacts.sort();
        contacts.dedup();
        for contact in &contacts {
            self.remove_session(contact)?;
        }
        Ok(())
    }

    /// Export identity, prekeys and sessions sealed under `passphrase`.
    pub async fn export_backup(&self, passphrase: &str) -> Result<BackupBlob, CryptoError> {
        let identity = self.identity()?;

        let mut sessions = Vec::new();
        for contact in Session::stored_contacts(&self.user_id, self.storage.as_ref())? {
            let Some(session) = Session::load_from_storage(
                &self.user_id,
                &contact,
                self.storage.as_ref(),
                self.keychain.as_ref(),
            )?
            else {
                continue;
            };
            sessions.push(BackupSession {
                record: session.record(),
                keys: session.export_keys().map(|k| BASE64.encode(k.as_slice())),
            });
        }

        let contents = BackupContents {
            user_id: self.user_id.clone(),
            identity_key: BASE64.encode(identity.secret_key_bytes()),
            signed_pre_key: self.prekeys.current_signed_prekey()?,
            one_time_pre_keys: self
                .prekeys
                .export_one_time_prekeys()?
                .into_iter()
                .map(|(id, private_key)| BackupPreKey {
                    id,
                    private_key: BASE64.encode(Zeroizing::new(private_key).as_slice()),
                })
                .collect(),
            next_one_time_id: self.prekeys.next_one_time_id()?,
            sessions,
            created_at: unix_millis(),
        };
        let session_count = contents.sessions.len();

        let passphrase = Zeroizing::new(passphrase.to_string());
        let iterations = self.config.backup_iterations;
        let blob = tokio::task::spawn_blocking(move || encrypt_backup(&contents, &passphrase, iterations))
            .await
            .map_err(|e| CryptoError::Backup(format!("backup task failed: {e}")))??;

        tracing::info!(sessions = session_count, "exported key backup");
        Ok(blob)
    }

    /// Replace local keys and sessions with the contents of a backup.
    pub async fn import_backup(&self, blob: &BackupBlob, passphrase: &str) -> Result<(), CryptoError> {
        let blob = blob.clone();
        let passphrase = Zeroizing::new(passphrase.to_string());
        let contents = tokio::task::spawn_blocking(move || decrypt_backup(&blob, &passphrase))
            .await
            .map_err(|e| CryptoError::Backup(format!("restore task failed: {e}")))??;

        if contents.user_id != self.user_id {
            return Err(CryptoError::Backup(format!(
                "backup belongs to {}, not {}",
                contents.user_id, self.user_id
            )));
        }

        let decode = |what: &str, value: &str| {
            BASE64
                .decode(value)
                .map(Zeroizing::new)
                .map_err(|e| CryptoError::Backup(format!("{what} encoding: {e}")))
        };
        let identity_bytes = decode("identity key", &contents.identity_key)?;
        let identity_secret: &[u8; 32] = identity_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::Backup("identity key must be 32 bytes".into()))?;
        let identity = Identity::from_secret_bytes(identity_secret);

        let mut one_time = Vec::with_capacity(contents.one_time_pre_keys.len());
        for prekey in &contents.one_time_pre_keys {
            one_time.push((prekey.id, decode("one-time prekey", &prekey.private_key)?.to_vec()));
        }
        let mut restored = Vec::with_capacity(contents.sessions.len());
        for entry in &contents.sessions {
            if entry.record.owner_id != self.user_id {
                continue;
            }
            let keys = entry
                .keys
                .as_deref()
                .map(|k| decode("session keys", k))
                .transpose()?;
            restored.push(Session::from_backup(&entry.record, keys.as_ref().map(|k| k.as_slice()))?);
        }

        self.wipe_sessions()?;
        self.identity_store.store_identity(&self.user_id, &identity)?;
        self.prekeys.import_prekeys(
            contents.signed_pre_key.as_ref(),
            &one_time,
            contents.next_one_time_id,
        )?;
        for (_, private_key) in &mut one_time {
            zeroize::Zeroize::zeroize(private_key);
        }
        for session in &restored {
            session.save_to_storage(self.storage.as_ref(), self.keychain.as_ref())?;
        }
        *self.identity.write() = Some(Arc::new(identity));

        tracing::info!(sessions = restored.len(), "restored key backup");
        // the server still holds whatever bundle this device published before
        if let Err(e) = self.publish_keys().await {
            tracing::warn!(error = %e, "failed to republish restored key bundle");
        }
        Ok(())
    }

    /// Logout: drop every in-memory key and session. Persisted state stays
    /// for the next login.
    pub fn shutdown(&self) {
        self.sessions.lock().clear();
        self.establishing.lock().clear();
        self.bundles.lock().clear();
        *self.identity.write() = None;
        *self.status.write() = EncryptionStatus::Disabled {
            reason: "engine shut down".into(),
        };
        tracing::info!(user = %self.user_id, "encryption engine shut down");
    }
}

fn utf8(bytes: Vec<u8>) -> Result<String, CryptoError> {
    String::from_utf8(bytes)
        .map_err(|_| CryptoError::DecryptionFailed("plaintext is not valid UTF-8".into()))
}
