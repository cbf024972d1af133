use crate::Error;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::fmt;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Fills a boxed array with bytes from the operating system's CSPRNG.
pub(crate) fn random_bytes<const N: usize>() -> Result<Box<[u8; N]>, Error> {
    let mut bytes = Box::new([0u8; N]);
    OsRng
        .try_fill_bytes(bytes.as_mut_slice())
        .map_err(|_| Error::Random)?;
    Ok(bytes)
}

/// An X25519 key pair used for the noise, ephemeral and pre-key roles.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair(Box<StaticSecret>);

impl KeyPair {
    /// Generates a fresh key pair.
    pub fn random() -> Result<Self, Error> {
        let mut seed = random_bytes::<32>()?;
        let secret = StaticSecret::from(*seed);
        seed.zeroize();
        Ok(Self(Box::new(secret)))
    }

    pub fn public_key(&self) -> [u8; 32] {
        PublicKey::from(self.0.as_ref()).to_bytes()
    }

    pub fn private_key(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Performs Diffie-Hellman key agreement with a peer's public key.
    pub fn agree(&self, public_key: &[u8; 32]) -> SharedSecret {
        self.0.diffie_hellman(&PublicKey::from(*public_key))
    }
}

impl From<[u8; 32]> for KeyPair {
    fn from(mut private_key: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_key);
        private_key.zeroize();
        Self(Box::new(secret))
    }
}

impl PartialEq for KeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for KeyPair {}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}
