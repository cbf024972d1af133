use crate::{Error, KeyPair, random_bytes};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Long-term identity of this device.
///
/// Holds an Ed25519 signing key, used to sign pre-keys and to check companion
/// proofs, and an X25519 key for agreement. Both are derived from one seed.
#[derive(Clone)]
pub struct IdentityKeyPair {
    signing_key: Box<SigningKey>,
    agreement_key: KeyPair,
}

impl IdentityKeyPair {
    /// Creates a new identity key pair from a random seed.
    pub fn random() -> Result<Self, Error> {
        let seed = random_bytes::<32>()?;
        Ok(Self::from_seed(seed))
    }

    fn from_seed(mut seed: Box<[u8; 32]>) -> Self {
        let signing_key = Box::new(SigningKey::from_bytes(&seed));
        let agreement_key = KeyPair::from(*seed);
        seed.zeroize();

        Self {
            signing_key,
            agreement_key,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Verifies a signature produced by this identity.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), Error> {
        self.signing_key
            .verifying_key()
            .verify_strict(message, signature)
            .map_err(|err| Error::CryptographicValidation(err.to_string()))
    }

    pub fn signing_public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn agreement_key(&self) -> &KeyPair {
        &self.agreement_key
    }

    /// Serializes the identity to 64 bytes.
    ///
    /// The first 32 bytes hold the Ed25519 private key, the last 32 the
    /// X25519 private key.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(self.signing_key.as_bytes().as_slice());
        bytes[32..64].copy_from_slice(&self.agreement_key.private_key());

        bytes
    }
}

impl From<[u8; 64]> for IdentityKeyPair {
    fn from(mut bytes: [u8; 64]) -> Self {
        let mut signing_bytes = [0u8; 32];
        signing_bytes.copy_from_slice(&bytes[0..32]);
        let signing_key = Box::new(SigningKey::from_bytes(&signing_bytes));
        signing_bytes.zeroize();

        let mut agreement_bytes = [0u8; 32];
        agreement_bytes.copy_from_slice(&bytes[32..64]);
        let agreement_key = KeyPair::from(agreement_bytes);
        bytes.zeroize();

        Self {
            signing_key,
            agreement_key,
        }
    }
}

impl PartialEq for IdentityKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.signing_key.as_bytes() == other.signing_key.as_bytes()
            && self.agreement_key == other.agreement_key
    }
}

impl Eq for IdentityKeyPair {}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("signing_public_key", &self.signing_public_key())
            .field("agreement_key", &self.agreement_key)
            .finish()
    }
}

impl ZeroizeOnDrop for IdentityKeyPair {}
