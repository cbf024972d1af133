use crate::{Error, LT_HASH_SIZE, MutationOperation, random_bytes};
use aes_gcm_siv::aead::Aead;
use aes_gcm_siv::{Aes256GcmSiv, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

const MUTATION_KEYS_INFO: &[u8] = b"WhatsApp Mutation Keys";
const NONCE_SIZE: usize = 12;
pub(crate) const VALUE_MAC_SIZE: usize = 32;

/// Key shared between linked devices to encrypt and authenticate app-state
/// mutations.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AppStateSyncKey {
    pub key_id: Vec<u8>,
    pub key_data: Vec<u8>,
    pub timestamp: i64,
}

impl AppStateSyncKey {
    pub fn new(key_id: Vec<u8>, key_data: Vec<u8>, timestamp: i64) -> Self {
        Self {
            key_id,
            key_data,
            timestamp,
        }
    }

    /// Generates a random key, as the primary device does when it shares a
    /// new key with its companions.
    pub fn random(timestamp: i64) -> Result<Self, Error> {
        let key_id = random_bytes::<6>()?;
        let key_data = random_bytes::<32>()?;
        Ok(Self::new(key_id.to_vec(), key_data.to_vec(), timestamp))
    }

    /// Base64 form of the key id, used in logs and errors.
    pub fn display_id(&self) -> String {
        STANDARD.encode(&self.key_id)
    }

    pub(crate) fn mutation_keys(&self) -> Result<MutationKeys, Error> {
        MutationKeys::derive(&self.key_data)
    }
}

impl fmt::Debug for AppStateSyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppStateSyncKey")
            .field("key_id", &self.display_id())
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

/// The five keys expanded from one [`AppStateSyncKey`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct MutationKeys {
    index: [u8; 32],
    value_encryption: [u8; 32],
    value_mac: [u8; 32],
    snapshot_mac: [u8; 32],
    patch_mac: [u8; 32],
}

impl MutationKeys {
    pub(crate) fn derive(key_data: &[u8]) -> Result<Self, Error> {
        let mut expanded = [0u8; 160];
        Hkdf::<Sha256>::new(None, key_data)
            .expand(MUTATION_KEYS_INFO, &mut expanded)
            .map_err(|err| Error::Crypto(format!("Mutation key expansion failed: {err}")))?;

        let mut keys = Self {
            index: [0u8; 32],
            value_encryption: [0u8; 32],
            value_mac: [0u8; 32],
            snapshot_mac: [0u8; 32],
            patch_mac: [0u8; 32],
        };
        keys.index.copy_from_slice(&expanded[0..32]);
        keys.value_encryption.copy_from_slice(&expanded[32..64]);
        keys.value_mac.copy_from_slice(&expanded[64..96]);
        keys.snapshot_mac.copy_from_slice(&expanded[96..128]);
        keys.patch_mac.copy_from_slice(&expanded[128..160]);
        expanded.zeroize();

        Ok(keys)
    }

    pub(crate) fn index_mac(&self, index: &[u8]) -> Result<[u8; 32], Error> {
        hmac_sha256(&self.index, &[index])
    }

    /// MAC over the operation byte, the key id and the encrypted value,
    /// followed by the big-endian length of the associated data.
    pub(crate) fn value_mac(
        &self,
        operation: MutationOperation,
        encrypted_value: &[u8],
        key_id: &[u8],
    ) -> Result<[u8; VALUE_MAC_SIZE], Error> {
        let associated_length = (key_id.len() as u64 + 1).to_be_bytes();

        let mut mac = <HmacSha512 as Mac>::new_from_slice(&self.value_mac)
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(&[operation.mac_byte()]);
        mac.update(key_id);
        mac.update(encrypted_value);
        mac.update(&associated_length);

        let mut truncated = [0u8; VALUE_MAC_SIZE];
        truncated.copy_from_slice(&mac.finalize().into_bytes()[..VALUE_MAC_SIZE]);
        Ok(truncated)
    }

    pub(crate) fn snapshot_mac(
        &self,
        hash: &[u8; LT_HASH_SIZE],
        version: u64,
        name: &str,
    ) -> Result<[u8; 32], Error> {
        hmac_sha256(
            &self.snapshot_mac,
            &[hash, &version.to_be_bytes(), name.as_bytes()],
        )
    }

    pub(crate) fn patch_mac(
        &self,
        snapshot_mac: &[u8],
        value_macs: &[&[u8]],
        version: u64,
        name: &str,
    ) -> Result<[u8; 32], Error> {
        let mut parts = Vec::with_capacity(value_macs.len() + 3);
        parts.push(snapshot_mac);
        parts.extend_from_slice(value_macs);
        let version = version.to_be_bytes();
        parts.push(&version);
        parts.push(name.as_bytes());

        hmac_sha256(&self.patch_mac, &parts)
    }

    /// Encrypts a serialized action; the output is the nonce followed by the
    /// ciphertext.
    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let nonce = random_bytes::<NONCE_SIZE>()?;
        let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(
            &self.value_encryption,
        ));
        let nonce = Nonce::from_slice(nonce.as_slice());

        let mut ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| Error::Crypto("Mutation encryption failed".to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(nonce);
        result.append(&mut ciphertext);
        Ok(result)
    }

    pub(crate) fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, Error> {
        if blob.len() < NONCE_SIZE {
            return Err(Error::Crypto("Encrypted mutation too short".to_string()));
        }

        let (nonce, ciphertext) = blob.split_at(NONCE_SIZE);
        let cipher = Aes256GcmSiv::new(aes_gcm_siv::Key::<Aes256GcmSiv>::from_slice(
            &self.value_encryption,
        ));
        Ok(cipher.decrypt(Nonce::from_slice(nonce), ciphertext)?)
    }
}

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32], Error> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(key).map_err(|err| Error::Crypto(err.to_string()))?;
    for part in parts {
        mac.update(part);
    }

    let mut result = [0u8; 32];
    result.copy_from_slice(&mac.finalize().into_bytes());
    Ok(result)
}
