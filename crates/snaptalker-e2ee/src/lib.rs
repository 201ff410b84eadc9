pub mod backup;
pub mod bundle;
mod cipher;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod keychain;
pub mod prekeys;
pub mod queue;
mod rng;
pub mod safety;
pub mod session;
pub mod storage;
pub mod transport;
pub mod x3dh;

pub use backup::BackupBlob;
pub use bundle::{KeyBundle, KeyBundleManager};
pub use config::EngineConfig;
pub use engine::{
    DecryptedMessage, DeliveryReport, EncryptionEngine, EncryptionStatus, OutgoingEnvelope,
    SendOutcome, DECRYPTION_FAILED_PLACEHOLDER,
};
pub use error::CryptoError;
pub use identity::{Identity, IdentityKeyStore};
pub use keychain::{Keychain, MemoryKeychain};
pub use prekeys::{PreKeyFactory, PublishedKeyBundle};
pub use queue::{OfflineMessageQueue, QueuedMessage, RetryStatus};
pub use rng::check_crypto_available;
pub use session::{EncryptedMessage, Session, SessionState};
pub use storage::{AppStorage, DirStorage, MemoryStorage};
pub use transport::{KeyTransport, MemoryTransport};
pub use x3dh::{HandshakeHeader, SharedSecret};
