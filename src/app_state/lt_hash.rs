use crate::{Error, MutationOperation, PatchType};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use sha2::Sha256;
use std::collections::BTreeMap;

pub const LT_HASH_SIZE: usize = 128;

const PATCH_INTEGRITY_INFO: &[u8] = b"WhatsApp Patch Integrity";

/// Adds `value` into the accumulator.
///
/// Each value is expanded to 128 bytes with HKDF-SHA256 and combined
/// point-wise as little-endian `u16` words with wrapping arithmetic, so
/// additions and subtractions commute.
pub(crate) fn add(hash: &mut [u8; LT_HASH_SIZE], value: &[u8]) -> Result<(), Error> {
    mix(hash, value, u16::wrapping_add)
}

/// Removes a value previously added with [`add`].
pub(crate) fn subtract(hash: &mut [u8; LT_HASH_SIZE], value: &[u8]) -> Result<(), Error> {
    mix(hash, value, u16::wrapping_sub)
}

fn mix(
    hash: &mut [u8; LT_HASH_SIZE],
    value: &[u8],
    op: fn(u16, u16) -> u16,
) -> Result<(), Error> {
    let mut expanded = [0u8; LT_HASH_SIZE];
    Hkdf::<Sha256>::new(None, value)
        .expand(PATCH_INTEGRITY_INFO, &mut expanded)
        .map_err(|err| Error::Crypto(format!("LT hash expansion failed: {err}")))?;

    for (word, delta) in hash.chunks_exact_mut(2).zip(expanded.chunks_exact(2)) {
        let current = u16::from_le_bytes([word[0], word[1]]);
        let delta = u16::from_le_bytes([delta[0], delta[1]]);
        word.copy_from_slice(&op(current, delta).to_le_bytes());
    }

    Ok(())
}

/// Verified position of one app-state category in its hash chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashChainState {
    pub version: u64,
    pub hash: [u8; LT_HASH_SIZE],
    /// Value MAC of the last SET for each index MAC (base64), so a later
    /// mutation of the same index can take the old contribution out.
    pub index_value_map: BTreeMap<String, Vec<u8>>,
}

impl Default for HashChainState {
    fn default() -> Self {
        Self {
            version: 0,
            hash: [0u8; LT_HASH_SIZE],
            index_value_map: BTreeMap::new(),
        }
    }
}

impl HashChainState {
    /// Folds one verified mutation into the accumulator.
    pub(crate) fn mix(
        &mut self,
        category: PatchType,
        operation: MutationOperation,
        index_mac: &[u8],
        value_mac: &[u8],
    ) -> Result<(), Error> {
        let index = STANDARD.encode(index_mac);
        let previous = self.index_value_map.remove(&index);

        match (operation, previous) {
            (MutationOperation::Set, previous) => {
                if let Some(previous) = previous {
                    subtract(&mut self.hash, &previous)?;
                }
                add(&mut self.hash, value_mac)?;
                self.index_value_map.insert(index, value_mac.to_vec());
            }
            (MutationOperation::Remove, Some(previous)) => {
                subtract(&mut self.hash, &previous)?;
            }
            (MutationOperation::Remove, None) => {
                return Err(Error::integrity(
                    category,
                    format!("remove of index {index} that was never set"),
                ));
            }
        }

        Ok(())
    }
}
