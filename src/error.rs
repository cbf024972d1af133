use crate::PatchType;

/// Errors that can occur while managing keys, app state or persisted sessions.
#[derive(thiserror::Error, Debug, Clone, Eq, PartialEq)]
pub enum Error {
    /// A patch or snapshot failed hash-chain verification.
    #[error("Integrity violation in {category}: {reason}")]
    IntegrityViolation {
        category: PatchType,
        reason: String,
    },

    /// No keys or store could be resolved for the requested identity.
    #[error("Unknown identity: {0}")]
    UnknownIdentity(String),

    /// Reading or writing persisted state failed.
    #[error("Storage failure: {0}")]
    Storage(String),

    /// A key store and a conversation store belonging to different sessions
    /// were presented together.
    #[error("Identity mismatch: keys belong to {keys}, store belongs to {store}")]
    IdentityMismatch { keys: String, store: String },

    /// A signature or authentication check on trust material failed.
    #[error("Cryptographic validation failed: {0}")]
    CryptographicValidation(String),

    /// A patch references an app-state sync key that is not known yet.
    #[error("Missing app state key: {0}")]
    MissingAppStateKey(String),

    /// A cryptographic operation failed.
    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    /// Random number generation failed.
    #[error("Random number generation failed")]
    Random,

    /// Serialization or deserialization failed.
    #[error("Serialization/deserialization failed: {0}")]
    Serde(String),

    /// An outgoing action was addressed at a target it cannot apply to.
    #[error("Invalid action: {0}")]
    InvalidAction(String),

    /// A value that is populated asynchronously did not become ready in time.
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl Error {
    pub(crate) fn integrity(category: PatchType, reason: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            category,
            reason: reason.into(),
        }
    }
}

impl From<aes_gcm_siv::Error> for Error {
    fn from(value: aes_gcm_siv::Error) -> Self {
        Self::Crypto(value.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(value: prost::DecodeError) -> Self {
        Self::Serde(value.to_string())
    }
}
