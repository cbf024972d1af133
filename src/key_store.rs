use crate::{
    AppStateSyncKey, ClientType, Error, HashChainState, IdentityKeyPair, KeyPair, KeyStoreConfig,
    PatchType, PreKeyPair, SenderKeyName, SenderKeyRecord, SessionAddress, SessionRecord,
    SignedPreKeyPair, Store, random_bytes,
};
use dashmap::DashMap;
use ed25519_dalek::{Signature, VerifyingKey};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;

const ACCOUNT_SIGNATURE_PREFIX: [u8; 2] = [6, 0];
const DEVICE_SIGNATURE_PREFIX: [u8; 2] = [6, 1];

/// Proof, signed by the primary device's account key, that this companion
/// belongs to the account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompanionIdentity {
    pub details: Vec<u8>,
    pub account_signature_key: [u8; 32],
    pub account_signature: [u8; 64],
    pub device_signature: Option<[u8; 64]>,
}

impl CompanionIdentity {
    /// Bytes the account key signs: the device details followed by this
    /// device's identity public key.
    pub fn account_message(details: &[u8], identity_public_key: &[u8; 32]) -> Vec<u8> {
        [
            ACCOUNT_SIGNATURE_PREFIX.as_slice(),
            details,
            identity_public_key.as_slice(),
        ]
        .concat()
    }
}

/// Key material and cryptographic session state of one session identity.
///
/// Every method takes `&self`; maps are sharded so concurrent readers never
/// contend on a global lock. Mutating calls bump [`KeyStore::revision`],
/// which persistence uses to skip unchanged writes.
pub struct KeyStore {
    pub(crate) uuid: Uuid,
    pub(crate) client_type: ClientType,
    pub(crate) config: KeyStoreConfig,
    pub(crate) registration_id: u32,
    pub(crate) noise_key_pair: KeyPair,
    pub(crate) ephemeral_key_pair: KeyPair,
    pub(crate) identity_key_pair: IdentityKeyPair,
    pub(crate) signed_pre_key: RwLock<SignedPreKeyPair>,
    pub(crate) signed_pre_key_rotated_at: AtomicU64,
    pub(crate) last_pre_key_id: AtomicU32,
    pub(crate) pre_keys: DashMap<u32, PreKeyPair>,
    pub(crate) sessions: DashMap<SessionAddress, SessionRecord>,
    pub(crate) sender_keys: DashMap<SenderKeyName, Arc<SenderKeyRecord>>,
    pub(crate) app_state_keys: RwLock<Vec<AppStateSyncKey>>,
    pub(crate) hash_states: DashMap<PatchType, HashChainState>,
    pub(crate) companion_identity: RwLock<Option<CompanionIdentity>>,
    write_counter: AtomicU64,
    read_counter: AtomicU64,
    revision: AtomicU64,
}

fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Refuses a key store and a store that belong to different sessions.
pub(crate) fn ensure_paired(keys: &KeyStore, store: &Store) -> Result<(), Error> {
    let store_uuid = store.uuid();
    if keys.uuid != store_uuid {
        return Err(Error::IdentityMismatch {
            keys: keys.uuid.to_string(),
            store: store_uuid.to_string(),
        });
    }
    Ok(())
}

impl KeyStore {
    /// Creates a key store with freshly generated keys, as done on the first
    /// connection of a new session.
    pub fn random(uuid: Uuid, client_type: ClientType, config: KeyStoreConfig) -> Result<Self, Error> {
        let identity_key_pair = IdentityKeyPair::random()?;
        let signed_pre_key = SignedPreKeyPair::generate(1, &identity_key_pair)?;
        let registration_id = {
            let bytes = random_bytes::<4>()?;
            (u32::from_be_bytes(*bytes) & 0x3fff).max(1)
        };

        info!(%uuid, %client_type, registration_id, "Created key store");

        Ok(Self {
            uuid,
            client_type,
            config,
            registration_id,
            noise_key_pair: KeyPair::random()?,
            ephemeral_key_pair: KeyPair::random()?,
            identity_key_pair,
            signed_pre_key: RwLock::new(signed_pre_key),
            signed_pre_key_rotated_at: AtomicU64::new(unix_seconds(SystemTime::now())),
            last_pre_key_id: AtomicU32::new(0),
            pre_keys: DashMap::new(),
            sessions: DashMap::new(),
            sender_keys: DashMap::new(),
            app_state_keys: RwLock::new(Vec::new()),
            hash_states: DashMap::new(),
            companion_identity: RwLock::new(None),
            write_counter: AtomicU64::new(0),
            read_counter: AtomicU64::new(0),
            revision: AtomicU64::new(1),
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        uuid: Uuid,
        client_type: ClientType,
        config: KeyStoreConfig,
        registration_id: u32,
        noise_key_pair: KeyPair,
        ephemeral_key_pair: KeyPair,
        identity_key_pair: IdentityKeyPair,
        signed_pre_key: SignedPreKeyPair,
        signed_pre_key_rotated_at: u64,
        last_pre_key_id: u32,
    ) -> Self {
        Self {
            uuid,
            client_type,
            config,
            registration_id,
            noise_key_pair,
            ephemeral_key_pair,
            identity_key_pair,
            signed_pre_key: RwLock::new(signed_pre_key),
            signed_pre_key_rotated_at: AtomicU64::new(signed_pre_key_rotated_at),
            last_pre_key_id: AtomicU32::new(last_pre_key_id),
            pre_keys: DashMap::new(),
            sessions: DashMap::new(),
            sender_keys: DashMap::new(),
            app_state_keys: RwLock::new(Vec::new()),
            hash_states: DashMap::new(),
            companion_identity: RwLock::new(None),
            write_counter: AtomicU64::new(0),
            read_counter: AtomicU64::new(0),
            revision: AtomicU64::new(1),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn registration_id(&self) -> u32 {
        self.registration_id
    }

    pub fn noise_key_pair(&self) -> &KeyPair {
        &self.noise_key_pair
    }

    pub fn ephemeral_key_pair(&self) -> &KeyPair {
        &self.ephemeral_key_pair
    }

    pub fn identity_key_pair(&self) -> &IdentityKeyPair {
        &self.identity_key_pair
    }

    /// Counter bumped by every mutation, read by change detection.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Records a change made through a shared handle, such as a
    /// [`SenderKeyRecord`] advanced by the group cipher.
    pub fn mark_dirty(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn find_session(&self, address: &SessionAddress) -> Option<SessionRecord> {
        self.sessions.get(address).map(|session| session.clone())
    }

    pub fn has_session(&self, address: &SessionAddress) -> bool {
        self.sessions.contains_key(address)
    }

    /// Stores `session` for `address`, replacing any previous record.
    pub fn put_session(&self, address: SessionAddress, session: SessionRecord) {
        self.sessions.insert(address, session);
        self.mark_dirty();
    }

    pub fn remove_session(&self, address: &SessionAddress) -> Option<SessionRecord> {
        let removed = self.sessions.remove(address).map(|(_, session)| session);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    /// Returns the record for `name`, inserting an empty one on first use.
    ///
    /// Insertion happens under the shard lock, so concurrent callers all get
    /// the same instance.
    pub fn find_or_create_sender_key(&self, name: &SenderKeyName) -> Arc<SenderKeyRecord> {
        let mut created = false;
        let record = self
            .sender_keys
            .entry(name.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(SenderKeyRecord::new())
            })
            .clone();

        if created {
            debug!(%name, "Created sender key record");
            self.mark_dirty();
        }
        record
    }

    pub fn find_pre_key_by_id(&self, id: u32) -> Option<PreKeyPair> {
        self.pre_keys.get(&id).map(|pre_key| pre_key.clone())
    }

    pub fn add_pre_key(&self, pre_key: PreKeyPair) {
        self.last_pre_key_id.fetch_max(pre_key.id(), Ordering::AcqRel);
        self.pre_keys.insert(pre_key.id(), pre_key);
        self.mark_dirty();
    }

    /// Highest pre-key id ever allocated, or 0 if none was.
    pub fn last_pre_key_id(&self) -> u32 {
        self.last_pre_key_id.load(Ordering::Acquire)
    }

    /// Generates `count` pre-keys with fresh ids following
    /// [`KeyStore::last_pre_key_id`].
    pub fn generate_pre_keys(&self, count: u32) -> Result<Vec<PreKeyPair>, Error> {
        let first = self.last_pre_key_id.fetch_add(count, Ordering::AcqRel) + 1;

        let mut generated = Vec::with_capacity(count as usize);
        for id in first..first + count {
            let pre_key = PreKeyPair::random(id)?;
            self.pre_keys.insert(id, pre_key.clone());
            generated.push(pre_key);
        }

        self.mark_dirty();
        Ok(generated)
    }

    /// Tops the pool up to the configured batch size.
    pub fn replenish_pre_keys(&self) -> Result<Vec<PreKeyPair>, Error> {
        let available = u32::try_from(self.pre_keys.len()).unwrap_or(u32::MAX);
        let missing = self.config.pre_key_batch.saturating_sub(available);
        if missing == 0 {
            return Ok(Vec::new());
        }
        self.generate_pre_keys(missing)
    }

    /// Removes a pre-key once a session was established from it.
    pub fn consume_pre_key(&self, id: u32) -> Option<PreKeyPair> {
        let removed = self.pre_keys.remove(&id).map(|(_, pre_key)| pre_key);
        if removed.is_some() {
            self.mark_dirty();
        }
        removed
    }

    pub fn pre_keys(&self) -> Vec<PreKeyPair> {
        let mut pre_keys: Vec<_> = self.pre_keys.iter().map(|entry| entry.clone()).collect();
        pre_keys.sort_by_key(PreKeyPair::id);
        pre_keys
    }

    pub fn signed_pre_key(&self) -> SignedPreKeyPair {
        self.signed_pre_key.read().clone()
    }

    /// Only the currently active signed pre-key can be found.
    pub fn find_signed_pre_key(&self, id: u32) -> Option<SignedPreKeyPair> {
        let signed_pre_key = self.signed_pre_key.read();
        (signed_pre_key.id() == id).then(|| signed_pre_key.clone())
    }

    pub fn rotate_signed_pre_key(&self) -> Result<SignedPreKeyPair, Error> {
        let mut current = self.signed_pre_key.write();
        let next = SignedPreKeyPair::generate(current.id().wrapping_add(1), &self.identity_key_pair)?;
        *current = next.clone();
        drop(current);

        self.signed_pre_key_rotated_at
            .store(unix_seconds(SystemTime::now()), Ordering::Release);
        self.mark_dirty();
        info!(uuid = %self.uuid, id = next.id(), "Rotated signed pre-key");
        Ok(next)
    }

    /// Rotates the signed pre-key if the configured interval has elapsed.
    pub fn rotate_signed_pre_key_if_due(&self) -> Result<Option<SignedPreKeyPair>, Error> {
        let rotated_at = self.signed_pre_key_rotated_at.load(Ordering::Acquire);
        let elapsed = unix_seconds(SystemTime::now()).saturating_sub(rotated_at);
        if Duration::from_secs(elapsed) < self.config.signed_pre_key_rotation_interval {
            return Ok(None);
        }
        self.rotate_signed_pre_key().map(Some)
    }

    pub fn find_app_state_key(&self, key_id: &[u8]) -> Option<AppStateSyncKey> {
        self.app_state_keys
            .read()
            .iter()
            .find(|key| key.key_id == key_id)
            .cloned()
    }

    /// Appends keys in the order given. A key whose id is already known
    /// replaces the old entry in place.
    pub fn add_app_state_keys(&self, keys: impl IntoIterator<Item = AppStateSyncKey>) {
        let mut stored = self.app_state_keys.write();
        for key in keys {
            match stored.iter_mut().find(|existing| existing.key_id == key.key_id) {
                Some(existing) => *existing = key,
                None => stored.push(key),
            }
        }
        drop(stored);
        self.mark_dirty();
    }

    /// The most recently appended key, used for outgoing mutations.
    pub fn latest_app_state_key(&self) -> Result<AppStateSyncKey, Error> {
        self.app_state_keys
            .read()
            .last()
            .cloned()
            .ok_or_else(|| Error::MissingAppStateKey("no app state keys".to_string()))
    }

    pub fn app_state_keys(&self) -> Vec<AppStateSyncKey> {
        self.app_state_keys.read().clone()
    }

    pub fn hash_chain_state(&self, category: PatchType) -> Option<HashChainState> {
        self.hash_states.get(&category).map(|state| state.clone())
    }

    pub fn put_hash_chain_state(&self, category: PatchType, state: HashChainState) {
        self.hash_states.insert(category, state);
        self.mark_dirty();
    }

    /// Fetches the write nonce counter, advancing it when `increment` is set.
    pub fn write_counter(&self, increment: bool) -> u64 {
        fetch(&self.write_counter, increment)
    }

    pub fn read_counter(&self, increment: bool) -> u64 {
        fetch(&self.read_counter, increment)
    }

    pub fn clear_counters(&self) {
        self.write_counter.store(0, Ordering::Release);
        self.read_counter.store(0, Ordering::Release);
    }

    pub fn companion_identity(&self) -> Option<CompanionIdentity> {
        self.companion_identity.read().clone()
    }

    /// Verifies the account signature on a companion proof and countersigns
    /// it with this device's identity key.
    pub fn set_companion_identity(
        &self,
        mut identity: CompanionIdentity,
    ) -> Result<CompanionIdentity, Error> {
        let account_key = VerifyingKey::from_bytes(&identity.account_signature_key)
            .map_err(|err| Error::CryptographicValidation(err.to_string()))?;
        let own_public_key = self.identity_key_pair.agreement_key().public_key();
        let message = CompanionIdentity::account_message(&identity.details, &own_public_key);

        account_key
            .verify_strict(&message, &Signature::from_bytes(&identity.account_signature))
            .map_err(|err| Error::CryptographicValidation(err.to_string()))?;

        let device_message = [
            DEVICE_SIGNATURE_PREFIX.as_slice(),
            identity.details.as_slice(),
            own_public_key.as_slice(),
            identity.account_signature_key.as_slice(),
        ]
        .concat();
        identity.device_signature = Some(self.identity_key_pair.sign(&device_message).to_bytes());

        *self.companion_identity.write() = Some(identity.clone());
        self.mark_dirty();
        Ok(identity)
    }
}

fn fetch(counter: &AtomicU64, increment: bool) -> u64 {
    if increment {
        counter.fetch_add(1, Ordering::AcqRel)
    } else {
        counter.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn key_store() -> KeyStore {
        KeyStore::random(Uuid::new_v4(), ClientType::Web, KeyStoreConfig::default()).unwrap()
    }

    #[test]
    fn test_pre_key_lookup() {
        let keys = key_store();
        assert_eq!(keys.last_pre_key_id(), 0);

        let first = PreKeyPair::random(1).unwrap();
        let second = PreKeyPair::random(2).unwrap();
        keys.add_pre_key(first);
        keys.add_pre_key(second.clone());

        assert_eq!(keys.last_pre_key_id(), 2);
        assert_eq!(keys.find_pre_key_by_id(2), Some(second));
        assert_eq!(keys.find_pre_key_by_id(99), None);
    }

    #[test]
    fn test_generated_pre_key_ids_are_monotonic() {
        let keys = key_store();
        keys.add_pre_key(PreKeyPair::random(5).unwrap());

        let generated = keys.generate_pre_keys(3).unwrap();
        let ids: Vec<_> = generated.iter().map(PreKeyPair::id).collect();
        assert_eq!(ids, [6, 7, 8]);

        assert!(keys.consume_pre_key(8).is_some());
        assert!(keys.consume_pre_key(8).is_none());
        assert_eq!(keys.last_pre_key_id(), 8);
        assert_eq!(keys.generate_pre_keys(1).unwrap()[0].id(), 9);
    }

    #[test]
    fn test_replenish_fills_to_batch() {
        let keys = KeyStore::random(
            Uuid::new_v4(),
            ClientType::Mobile,
            KeyStoreConfig {
                pre_key_batch: 4,
                ..KeyStoreConfig::default()
            },
        )
        .unwrap();

        assert_eq!(keys.replenish_pre_keys().unwrap().len(), 4);
        keys.consume_pre_key(2);
        assert_eq!(keys.replenish_pre_keys().unwrap().len(), 1);
        assert!(keys.replenish_pre_keys().unwrap().is_empty());
    }

    #[test]
    fn test_session_overwrite() {
        let keys = key_store();
        let address = SessionAddress::new("15550001111", 0);

        keys.put_session(address.clone(), SessionRecord::new(vec![1]));
        keys.put_session(address.clone(), SessionRecord::new(vec![2]));

        assert!(keys.has_session(&address));
        assert_eq!(keys.find_session(&address), Some(SessionRecord::new(vec![2])));
        assert_eq!(keys.find_session(&SessionAddress::new("other", 0)), None);
    }

    #[test]
    fn test_concurrent_sender_key_creation() {
        let keys = Arc::new(key_store());
        let name = SenderKeyName::new("group@g.us", SessionAddress::new("15550001111", 1));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let keys = keys.clone();
                let name = name.clone();
                thread::spawn(move || keys.find_or_create_sender_key(&name))
            })
            .collect();

        let records: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for record in &records {
            assert!(Arc::ptr_eq(record, &records[0]));
        }
        assert_eq!(keys.sender_keys.len(), 1);
    }

    #[test]
    fn test_signed_pre_key_rotation() {
        let keys = key_store();
        let first = keys.signed_pre_key();
        assert!(keys.find_signed_pre_key(first.id()).is_some());

        let second = keys.rotate_signed_pre_key().unwrap();
        assert_eq!(second.id(), first.id() + 1);
        assert!(keys.find_signed_pre_key(first.id()).is_none());
        assert!(second
            .verify(&keys.identity_key_pair().signing_public_key())
            .is_ok());

        assert!(keys.rotate_signed_pre_key_if_due().unwrap().is_none());
    }

    #[test]
    fn test_app_state_keys() {
        let keys = key_store();
        assert!(matches!(
            keys.latest_app_state_key(),
            Err(Error::MissingAppStateKey(_))
        ));

        let first = AppStateSyncKey::new(vec![1], vec![1; 32], 10);
        let second = AppStateSyncKey::new(vec![2], vec![2; 32], 20);
        keys.add_app_state_keys([first.clone(), second.clone()]);

        assert_eq!(keys.latest_app_state_key().unwrap(), second);
        assert_eq!(keys.find_app_state_key(&[1]), Some(first));
        assert_eq!(keys.find_app_state_key(&[3]), None);

        let replaced = AppStateSyncKey::new(vec![1], vec![9; 32], 30);
        keys.add_app_state_keys([replaced.clone()]);
        assert_eq!(keys.app_state_keys().len(), 2);
        assert_eq!(keys.find_app_state_key(&[1]), Some(replaced));
        assert_eq!(keys.latest_app_state_key().unwrap(), second);
    }

    #[test]
    fn test_counters() {
        let keys = key_store();
        assert_eq!(keys.write_counter(true), 0);
        assert_eq!(keys.write_counter(true), 1);
        assert_eq!(keys.write_counter(false), 2);
        assert_eq!(keys.read_counter(false), 0);

        keys.clear_counters();
        assert_eq!(keys.write_counter(false), 0);
    }

    #[test]
    fn test_mutations_bump_revision() {
        let keys = key_store();
        let before = keys.revision();
        keys.put_hash_chain_state(PatchType::Regular, HashChainState::default());
        assert!(keys.revision() > before);

        let before = keys.revision();
        keys.write_counter(true);
        assert!(keys.find_session(&SessionAddress::new("x", 0)).is_none());
        assert_eq!(keys.revision(), before);
    }

    #[test]
    fn test_companion_identity_verification() {
        let keys = key_store();
        let account = IdentityKeyPair::random().unwrap();
        let details = b"device details".to_vec();
        let message = CompanionIdentity::account_message(
            &details,
            &keys.identity_key_pair().agreement_key().public_key(),
        );

        let proof = CompanionIdentity {
            details: details.clone(),
            account_signature_key: account.signing_public_key().to_bytes(),
            account_signature: account.sign(&message).to_bytes(),
            device_signature: None,
        };
        let accepted = keys.set_companion_identity(proof.clone()).unwrap();
        assert!(accepted.device_signature.is_some());
        assert_eq!(keys.companion_identity(), Some(accepted));

        let forged = CompanionIdentity {
            details: b"other details".to_vec(),
            ..proof
        };
        assert!(matches!(
            keys.set_companion_identity(forged),
            Err(Error::CryptographicValidation(_))
        ));
    }
}
