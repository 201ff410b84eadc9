//! X3DH asynchronous key agreement.
//!
//! The initiator combines its identity and a fresh ephemeral key with the
//! responder's published bundle; the responder later repeats the same four
//! Diffie-Hellman operations from its side and lands on the same secret.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::bundle::{decode_key, KeyBundle};
use crate::cipher::{hkdf32, open, seal};
use crate::error::CryptoError;
use crate::identity::Identity;
use crate::prekeys::{unix_millis, OneTimePreKey, SignedPreKey};
use crate::rng::random_bytes;

const X3DH_INFO: &[u8] = b"X3DH_Shared_Secret";
const X3DH_SALT: [u8; 32] = [0u8; 32];
const INITIAL_MESSAGE_INFO: &[u8] = b"X3DH_Initial_Message";

/// Output of a handshake. Wiped on drop.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub(crate) fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Single-use X25519 key pair for the initiator side.
pub struct EphemeralKeyPair {
    secret: StaticSecret,
    public: X25519Public,
}

impl EphemeralKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let seed = Zeroizing::new(random_bytes::<32>()?);
        let secret = StaticSecret::from(*seed);
        let public = X25519Public::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// Public keys and ids bound into a handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociatedData {
    pub initiator_identity_key: String,
    pub responder_identity_key: String,
    pub initiator_ephemeral_key: String,
    pub responder_signed_pre_key_id: u32,
    pub responder_one_time_pre_key_id: Option<u32>,
}

impl AssociatedData {
    /// Canonical byte form used as AEAD additional data.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// What the initiator sends along with its first message so the responder
/// can complete the agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeHeader {
    pub initiator_id: String,
    pub identity_key: String,
    pub ephemeral_key: String,
    pub signed_pre_key_id: u32,
    pub one_time_pre_key_id: Option<u32>,
}

impl HandshakeHeader {
    pub fn new(initiator_id: &str, ad: &AssociatedData) -> Self {
        Self {
            initiator_id: initiator_id.to_string(),
            identity_key: ad.initiator_identity_key.clone(),
            ephemeral_key: ad.initiator_ephemeral_key.clone(),
            signed_pre_key_id: ad.responder_signed_pre_key_id,
            one_time_pre_key_id: ad.responder_one_time_pre_key_id,
        }
    }

    /// Associated data as seen by the responder.
    pub fn associated_data(&self, responder_identity_key: &[u8; 32]) -> AssociatedData {
        AssociatedData {
            initiator_identity_key: self.identity_key.clone(),
            responder_identity_key: BASE64.encode(responder_identity_key),
            initiator_ephemeral_key: self.ephemeral_key.clone(),
            responder_signed_pre_key_id: self.signed_pre_key_id,
            responder_one_time_pre_key_id: self.one_time_pre_key_id,
        }
    }
}

#[derive(Debug)]
pub struct KeyAgreement {
    pub shared_secret: SharedSecret,
    pub associated_data: AssociatedData,
    pub used_one_time_prekey_id: Option<u32>,
}

impl KeyAgreement {
    /// True when the peer's bundle had no one-time prekey, so the agreement
    /// lacks the fourth DH leg.
    pub fn reduced_forward_secrecy(&self) -> bool {
        self.used_one_time_prekey_id.is_none()
    }
}

/// First message encrypted directly under the shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialMessage {
    pub associated_data: AssociatedData,
    pub ciphertext: String,
    pub iv: String,
    pub timestamp: u64,
}

/// Check the bundle's signed prekey signature against its identity key.
pub fn verify_bundle(bundle: &KeyBundle) -> Result<(), CryptoError> {
    let identity_key = bundle.identity_key_bytes()?;
    let signed_pre_key = bundle.signed_pre_key_bytes()?;
    let signature = bundle.signature_bytes()?;
    Identity::verify(&identity_key, &signed_pre_key, &signature)
}

fn dh(secret: &StaticSecret, public: &X25519Public) -> Result<[u8; 32], CryptoError> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(CryptoError::HandshakeFailure(
            "low-order public key in key agreement".into(),
        ));
    }
    Ok(*shared.as_bytes())
}

fn derive_shared_secret(outputs: &[[u8; 32]]) -> Result<SharedSecret, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(outputs.len() * 32));
    for output in outputs {
        ikm.extend_from_slice(output);
    }
    let okm = hkdf32(Some(X3DH_SALT.as_slice()), &ikm, X3DH_INFO)
        .map_err(|e| CryptoError::HandshakeFailure(e.to_string()))?;
    Ok(SharedSecret::from_bytes(okm))
}

/// Initiator side.
///
/// The bundle signature is checked before any DH is computed; an unverified
/// bundle never produces a secret.
pub fn initiate_key_agreement(
    our_identity: &Identity,
    our_ephemeral: &EphemeralKeyPair,
    their_bundle: &KeyBundle,
) -> Result<KeyAgreement, CryptoError> {
    verify_bundle(their_bundle)?;

    let their_identity_key = their_bundle.identity_key_bytes()?;
    let their_identity = Identity::peer_ed25519_to_x25519(&their_identity_key)?;
    let their_signed_pre_key = X25519Public::from(their_bundle.signed_pre_key_bytes()?);
    let their_one_time = their_bundle.one_time_pre_key_bytes()?;

    let our_identity_secret = our_identity.to_x25519_secret();

    let mut outputs = Zeroizing::new(Vec::with_capacity(4));
    outputs.push(dh(&our_identity_secret, &their_signed_pre_key)?);
    outputs.push(dh(&our_ephemeral.secret, &their_identity)?);
    outputs.push(dh(&our_ephemeral.secret, &their_signed_pre_key)?);
    if let Some((_, otk)) = &their_one_time {
        outputs.push(dh(&our_ephemeral.secret, &X25519Public::from(*otk))?);
    }

    let shared_secret = derive_shared_secret(&outputs)?;
    let used_one_time_prekey_id = their_one_time.map(|(id, _)| id);

    if used_one_time_prekey_id.is_none() {
        tracing::warn!(
            peer = %their_bundle.user_id,
            "peer bundle has no one-time prekey, agreement has reduced forward secrecy"
        );
    }

    Ok(KeyAgreement {
        shared_secret,
        associated_data: AssociatedData {
            initiator_identity_key: BASE64.encode(our_identity.public_key_bytes()),
            responder_identity_key: their_bundle.identity_key.clone(),
            initiator_ephemeral_key: BASE64.encode(our_ephemeral.public_key_bytes()),
            responder_signed_pre_key_id: their_bundle.signed_pre_key.id,
            responder_one_time_pre_key_id: used_one_time_prekey_id,
        },
        used_one_time_prekey_id,
    })
}

/// Responder side. Operand order is mirrored per DH pair so the result is
/// bit-identical to the initiator's.
pub fn respond_to_key_agreement(
    our_identity: &Identity,
    our_signed_pre_key: &SignedPreKey,
    our_one_time_pre_key: Option<&OneTimePreKey>,
    their_identity_key: &[u8],
    their_ephemeral_key: &[u8],
) -> Result<SharedSecret, CryptoError> {
    let their_identity = Identity::peer_ed25519_to_x25519(their_identity_key)?;
    let their_ephemeral: [u8; 32] = their_ephemeral_key
        .try_into()
        .map_err(|_| CryptoError::HandshakeFailure("ephemeral key wrong length".into()))?;
    let their_ephemeral = X25519Public::from(their_ephemeral);

    let spk_secret = our_signed_pre_key.secret();

    let mut outputs = Zeroizing::new(Vec::with_capacity(4));
    outputs.push(dh(&spk_secret, &their_identity)?);
    outputs.push(dh(&our_identity.to_x25519_secret(), &their_ephemeral)?);
    outputs.push(dh(&spk_secret, &their_ephemeral)?);
    if let Some(otk) = our_one_time_pre_key {
        outputs.push(dh(&otk.secret(), &their_ephemeral)?);
    }

    derive_shared_secret(&outputs)
}

/// Responder side driven by a received header.
pub fn respond_to_header(
    our_identity: &Identity,
    our_signed_pre_key: &SignedPreKey,
    our_one_time_pre_key: Option<&OneTimePreKey>,
    header: &HandshakeHeader,
) -> Result<SharedSecret, CryptoError> {
    let their_identity_key = decode_key("initiator identity key", &header.identity_key)?;
    let their_ephemeral_key = decode_key("initiator ephemeral key", &header.ephemeral_key)?;
    respond_to_key_agreement(
        our_identity,
        our_signed_pre_key,
        our_one_time_pre_key,
        &their_identity_key,
        &their_ephemeral_key,
    )
}

/// Encrypt a first message under the shared secret, authenticated against
/// the handshake's associated data.
pub fn seal_initial_message(
    secret: &SharedSecret,
    associated_data: &AssociatedData,
    plaintext: &[u8],
) -> Result<InitialMessage, CryptoError> {
    let key = Zeroizing::new(hkdf32(None, secret.as_bytes(), INITIAL_MESSAGE_INFO)?);
    let (ciphertext, iv) = seal(&key, plaintext, &associated_data.to_bytes()?)?;
    Ok(InitialMessage {
        associated_data: associated_data.clone(),
        ciphertext: BASE64.encode(ciphertext),
        iv: BASE64.encode(iv),
        timestamp: unix_millis(),
    })
}

/// Decrypt an initial message. `expected` is the associated data the
/// responder reconstructed itself; a message claiming different keys fails.
pub fn open_initial_message(
    secret: &SharedSecret,
    expected: &AssociatedData,
    message: &InitialMessage,
) -> Result<Vec<u8>, CryptoError> {
    if &message.associated_data != expected {
        return Err(CryptoError::DecryptionFailed(
            "associated data does not match handshake".into(),
        ));
    }
    let key = Zeroizing::new(hkdf32(None, secret.as_bytes(), INITIAL_MESSAGE_INFO)?);
    let ciphertext = BASE64
        .decode(&message.ciphertext)
        .map_err(|e| CryptoError::DecryptionFailed(format!("ciphertext encoding: {e}")))?;
    let iv = BASE64
        .decode(&message.iv)
        .map_err(|e| CryptoError::DecryptionFailed(format!("iv encoding: {e}")))?;
    open(&key, &iv, &ciphertext, &expected.to_bytes()?)
}
