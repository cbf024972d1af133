use crate::{Error, IdentityKeyPair, KeyPair};
use ed25519_dalek::{Signature, VerifyingKey};

/// A one-time pre-key published ahead of time so peers can open a session
/// without a round trip.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreKeyPair {
    id: u32,
    key_pair: KeyPair,
}

impl PreKeyPair {
    pub fn new(id: u32, key_pair: KeyPair) -> Self {
        Self { id, key_pair }
    }

    pub fn random(id: u32) -> Result<Self, Error> {
        Ok(Self::new(id, KeyPair::random()?))
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key_pair.public_key()
    }
}

/// A medium-term pre-key whose public half is signed by the identity key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPreKeyPair {
    id: u32,
    key_pair: KeyPair,
    signature: [u8; 64],
}

impl SignedPreKeyPair {
    /// Generates a fresh key pair and signs its public key with `identity`.
    pub fn generate(id: u32, identity: &IdentityKeyPair) -> Result<Self, Error> {
        let key_pair = KeyPair::random()?;
        let signature = identity.sign(&key_pair.public_key()).to_bytes();

        Ok(Self {
            id,
            key_pair,
            signature,
        })
    }

    pub(crate) fn from_parts(id: u32, key_pair: KeyPair, signature: [u8; 64]) -> Self {
        Self {
            id,
            key_pair,
            signature,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.key_pair.public_key()
    }

    pub fn signature(&self) -> &[u8; 64] {
        &self.signature
    }

    /// Checks the signature against the identity's public signing key.
    pub fn verify(&self, identity: &VerifyingKey) -> Result<(), Error> {
        let signature = Signature::from_bytes(&self.signature);
        identity
            .verify_strict(&self.public_key(), &signature)
            .map_err(|err| Error::CryptographicValidation(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_pre_key_verifies_against_identity() {
        let identity = IdentityKeyPair::random().unwrap();
        let signed = SignedPreKeyPair::generate(7, &identity).unwrap();

        assert_eq!(signed.id(), 7);
        assert!(signed.verify(&identity.signing_public_key()).is_ok());

        let stranger = IdentityKeyPair::random().unwrap();
        assert!(signed.verify(&stranger.signing_public_key()).is_err());
    }

    #[test]
    fn test_pre_key_exposes_public_half() {
        let pre_key = PreKeyPair::random(3).unwrap();

        assert_eq!(pre_key.id(), 3);
        assert_eq!(pre_key.public_key(), pre_key.key_pair().public_key());
        assert!(!pre_key.public_key().iter().all(|&b| b == 0));
    }
}
