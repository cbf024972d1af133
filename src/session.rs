use crate::Error;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

type HmacSha256 = Hmac<Sha256>;

/// Serialized ratchet state for one peer device.
///
/// The cipher layer owns the format; the key store only stores and replaces
/// records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionRecord(Vec<u8>);

impl SessionRecord {
    pub fn new(state: Vec<u8>) -> Self {
        Self(state)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_fresh(&self) -> bool {
        self.0.is_empty()
    }
}

/// One generation of a group sender chain.
#[derive(Clone, Debug, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SenderKeyState {
    pub key_id: u32,
    pub iteration: u32,
    pub chain_key: [u8; 32],
    pub signing_public_key: [u8; 32],
}

impl SenderKeyState {
    pub fn new(key_id: u32, chain_key: [u8; 32], signing_public_key: [u8; 32]) -> Self {
        Self {
            key_id,
            iteration: 0,
            chain_key,
            signing_public_key,
        }
    }

    /// Advances the chain and returns the message key for the current
    /// iteration.
    pub fn next_message_key(&mut self) -> Result<[u8; 32], Error> {
        let message_key = self.derive(0x01)?;
        let next_chain_key = self.derive(0x02)?;

        self.chain_key = next_chain_key;
        self.iteration = self.iteration.wrapping_add(1);

        Ok(message_key)
    }

    fn derive(&self, seed: u8) -> Result<[u8; 32], Error> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.chain_key)
            .map_err(|err| Error::Crypto(err.to_string()))?;
        mac.update(&[seed]);

        let mut key = [0u8; 32];
        key.copy_from_slice(&mac.finalize().into_bytes());
        Ok(key)
    }
}

/// Group cipher state for one `(group, sender)` pair.
///
/// Shared by reference between the key store and the group cipher so that
/// every caller observes the same instance.
#[derive(Debug, Default)]
pub struct SenderKeyRecord {
    states: Mutex<Vec<SenderKeyState>>,
}

/// Older generations kept around to decrypt late messages.
const MAX_SENDER_KEY_STATES: usize = 5;

impl SenderKeyRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().is_empty()
    }

    pub fn add_state(&self, state: SenderKeyState) {
        let mut states = self.states.lock();
        states.retain(|existing| existing.key_id != state.key_id);
        states.push(state);
        if states.len() > MAX_SENDER_KEY_STATES {
            states.remove(0);
        }
    }

    pub fn latest_state(&self) -> Option<SenderKeyState> {
        self.states.lock().last().cloned()
    }

    pub fn find_state(&self, key_id: u32) -> Option<SenderKeyState> {
        self.states
            .lock()
            .iter()
            .find(|state| state.key_id == key_id)
            .cloned()
    }

    /// Advances the chain of `key_id` in place.
    pub fn next_message_key(&self, key_id: u32) -> Result<Option<[u8; 32]>, Error> {
        let mut states = self.states.lock();
        match states.iter_mut().find(|state| state.key_id == key_id) {
            Some(state) => state.next_message_key().map(Some),
            None => Ok(None),
        }
    }

    pub fn states(&self) -> Vec<SenderKeyState> {
        self.states.lock().clone()
    }
}
