use super::sync_key::{MutationKeys, VALUE_MAC_SIZE};
use crate::{
    AppStateConfig, Error, HashChainState, KeyStore, MessageIndex, Mutation, MutationOperation,
    Patch, PatchAck, PatchRequest, PatchTransport, PatchType, PendingMutation,
    PersistenceController, Record, Snapshot, Store, SyncAction, SyncActionData, SyncActionValue,
    WriteMode, ensure_paired,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use parking_lot::Mutex;
use prost::Message;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYNC_ACTION_DATA_VERSION: i32 = 2;

/// Where a category stands in its hash chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncStatus {
    Synced { version: u64 },
    Applying { version: u64 },
    /// Verification failed; nothing is applied until a resync.
    Corrupted,
    /// Reset to version 0 and waiting for the full history.
    Resyncing,
}

/// A resolved mutation, as delivered to listeners.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppStateEvent {
    pub category: PatchType,
    pub operation: MutationOperation,
    pub index: MessageIndex,
    pub action: SyncAction,
    pub timestamp: i64,
}

pub trait AppStateListener: Send + Sync {
    fn on_event(&self, event: &AppStateEvent);
}

/// Lock and published status of one category.
struct Category {
    /// Held for the whole of an apply, so work on a category is sequential.
    work: Mutex<()>,
    status: Mutex<SyncStatus>,
}

impl Category {
    fn status(&self) -> SyncStatus {
        *self.status.lock()
    }

    fn set_status(&self, status: SyncStatus) {
        *self.status.lock() = status;
    }
}

struct DecodedMutation {
    operation: MutationOperation,
    index: MessageIndex,
    value: SyncActionValue,
    value_mac: Vec<u8>,
}

/// Applies and produces hash-chain verified app-state patches.
///
/// Work on one category is serialized by that category's lock; different
/// categories proceed independently. The status is published separately, so
/// [`AppStatePatchEngine::status`] reports [`SyncStatus::Applying`] while a
/// batch is being verified.
pub struct AppStatePatchEngine {
    config: AppStateConfig,
    keys: Arc<KeyStore>,
    store: Arc<Store>,
    listeners: Vec<Arc<dyn AppStateListener>>,
    persistence: Option<PersistenceController>,
    categories: DashMap<PatchType, Arc<Category>>,
}

impl AppStatePatchEngine {
    /// Fails with [`Error::IdentityMismatch`] if `keys` and `store` belong to
    /// different sessions.
    pub fn new(
        config: AppStateConfig,
        keys: Arc<KeyStore>,
        store: Arc<Store>,
        listeners: Vec<Arc<dyn AppStateListener>>,
    ) -> Result<Self, Error> {
        ensure_paired(&keys, &store)?;

        Ok(Self {
            config,
            keys,
            store,
            listeners,
            persistence: None,
            categories: DashMap::new(),
        })
    }

    /// Persists keys and store asynchronously after every committed patch.
    pub fn with_persistence(mut self, persistence: PersistenceController) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn status(&self, category: PatchType) -> SyncStatus {
        self.slot(category).status()
    }

    fn slot(&self, category: PatchType) -> Arc<Category> {
        self.categories
            .entry(category)
            .or_insert_with(|| {
                let version = self
                    .keys
                    .hash_chain_state(category)
                    .map_or(0, |state| state.version);
                Arc::new(Category {
                    work: Mutex::new(()),
                    status: Mutex::new(SyncStatus::Synced { version }),
                })
            })
            .clone()
    }

    /// Verifies `patches` against the category's hash chain and, only if all
    /// of them verify, commits them.
    ///
    /// Patches at or below the current version were applied already and are
    /// skipped. A gap in the versions or a failed MAC check marks the
    /// category [`SyncStatus::Corrupted`] and leaves the store untouched. An
    /// unknown key id fails the batch without corrupting the category, since
    /// the key may still arrive.
    pub fn apply_patches(
        &self,
        category: PatchType,
        patches: &[Patch],
    ) -> Result<Vec<AppStateEvent>, Error> {
        let slot = self.slot(category);
        let _work = slot.work.lock();
        let previous = slot.status();

        if previous == SyncStatus::Corrupted {
            return Err(Error::integrity(category, "category needs a full resync"));
        }

        let state = self.keys.hash_chain_state(category).unwrap_or_default();
        let current = state.version;
        if patches.iter().all(|patch| patch.version <= current) {
            if !patches.is_empty() {
                debug!(%category, version = current, "Ignoring redelivered app state patches");
            }
            return Ok(Vec::new());
        }

        slot.set_status(SyncStatus::Applying {
            version: current + 1,
        });
        match self.verify_patches(category, state, patches) {
            Ok((state, decoded)) => {
                let version = state.version;
                let events = self.commit(category, state, decoded);
                slot.set_status(SyncStatus::Synced { version });
                info!(%category, version, mutations = events.len(), "Applied app state patches");
                Ok(events)
            }
            Err(err) => Err(self.fail(category, &slot, previous, err)),
        }
    }

    /// Replaces the category's state with a full snapshot.
    ///
    /// A snapshot that is not newer than the current state is ignored, unless
    /// the category is at version 0.
    pub fn apply_snapshot(
        &self,
        category: PatchType,
        snapshot: &Snapshot,
    ) -> Result<Vec<AppStateEvent>, Error> {
        let slot = self.slot(category);
        let _work = slot.work.lock();
        let previous = slot.status();

        let current = self
            .keys
            .hash_chain_state(category)
            .map_or(0, |state| state.version);
        if current != 0 && snapshot.version <= current {
            debug!(%category, current, version = snapshot.version, "Ignoring stale app state snapshot");
            return Ok(Vec::new());
        }

        slot.set_status(SyncStatus::Applying {
            version: snapshot.version,
        });
        match self.verify_snapshot(category, snapshot) {
            Ok((state, decoded)) => {
                let events = self.commit(category, state, decoded);
                slot.set_status(SyncStatus::Synced {
                    version: snapshot.version,
                });
                info!(%category, version = snapshot.version, records = events.len(), "Applied app state snapshot");
                Ok(events)
            }
            Err(err) => Err(self.fail(category, &slot, previous, err)),
        }
    }

    /// Drops the category back to version 0 so the full history can be
    /// replayed.
    pub fn reset_for_resync(&self, category: PatchType) {
        let slot = self.slot(category);
        let _work = slot.work.lock();
        self.keys
            .put_hash_chain_state(category, HashChainState::default());
        slot.set_status(SyncStatus::Resyncing);
        info!(%category, "Reset app state category for resync");
    }

    fn fail(
        &self,
        category: PatchType,
        slot: &Category,
        previous: SyncStatus,
        err: Error,
    ) -> Error {
        match err {
            Error::MissingAppStateKey(_) => {
                warn!(%category, error = %err, "Cannot apply app state patch yet");
                slot.set_status(previous);
                err
            }
            Error::IntegrityViolation { .. } => {
                warn!(%category, error = %err, "App state category corrupted");
                slot.set_status(SyncStatus::Corrupted);
                err
            }
            other => {
                warn!(%category, error = %other, "App state category corrupted");
                slot.set_status(SyncStatus::Corrupted);
                Error::integrity(category, other.to_string())
            }
        }
    }

    fn mutation_keys(&self, key_id: &[u8]) -> Result<MutationKeys, Error> {
        self.keys
            .find_app_state_key(key_id)
            .ok_or_else(|| Error::MissingAppStateKey(STANDARD.encode(key_id)))?
            .mutation_keys()
    }

    fn verify_patches(
        &self,
        category: PatchType,
        mut state: HashChainState,
        patches: &[Patch],
    ) -> Result<(HashChainState, Vec<DecodedMutation>), Error> {
        let mut decoded = Vec::new();

        for patch in patches {
            if patch.version <= state.version {
                debug!(%category, version = patch.version, "Skipping redelivered app state patch");
                continue;
            }
            let expected = state.version + 1;
            if patch.version != expected {
                return Err(Error::integrity(
                    category,
                    format!("expected version {expected}, got {}", patch.version),
                ));
            }

            let first = decoded.len();
            for mutation in &patch.mutations {
                let operation = MutationOperation::from_wire(mutation.operation)?;
                let record = mutation
                    .record
                    .as_ref()
                    .ok_or_else(|| Error::integrity(category, "mutation without a record"))?;

                let mutation = self.decode_record(category, operation, record)?;
                state.mix(category, operation, &record.index_mac, &mutation.value_mac)?;
                decoded.push(mutation);
            }
            state.version = patch.version;

            if self.config.check_patch_macs {
                let keys = self.mutation_keys(&patch.key_id)?;
                let snapshot_mac = keys.snapshot_mac(&state.hash, state.version, category.name())?;
                if snapshot_mac.as_slice() != patch.snapshot_mac.as_slice() {
                    return Err(Error::integrity(
                        category,
                        format!("snapshot MAC mismatch at version {}", state.version),
                    ));
                }

                let value_macs: Vec<&[u8]> = decoded[first..]
                    .iter()
                    .map(|mutation| mutation.value_mac.as_slice())
                    .collect();
                let patch_mac =
                    keys.patch_mac(&snapshot_mac, &value_macs, state.version, category.name())?;
                if patch_mac.as_slice() != patch.patch_mac.as_slice() {
                    return Err(Error::integrity(
                        category,
                        format!("patch MAC mismatch at version {}", state.version),
                    ));
                }
            }
        }

        Ok((state, decoded))
    }

    fn verify_snapshot(
        &self,
        category: PatchType,
        snapshot: &Snapshot,
    ) -> Result<(HashChainState, Vec<DecodedMutation>), Error> {
        let mut state = HashChainState {
            version: snapshot.version,
            ..HashChainState::default()
        };

        let mut decoded = Vec::with_capacity(snapshot.records.len());
        for record in &snapshot.records {
            let mutation = self.decode_record(category, MutationOperation::Set, record)?;
            state.mix(
                category,
                MutationOperation::Set,
                &record.index_mac,
                &mutation.value_mac,
            )?;
            decoded.push(mutation);
        }

        if self.config.check_patch_macs {
            let keys = self.mutation_keys(&snapshot.key_id)?;
            let mac = keys.snapshot_mac(&state.hash, state.version, category.name())?;
            if mac.as_slice() != snapshot.mac.as_slice() {
                return Err(Error::integrity(
                    category,
                    format!("snapshot MAC mismatch at version {}", state.version),
                ));
            }
        }

        Ok((state, decoded))
    }

    fn decode_record(
        &self,
        category: PatchType,
        operation: MutationOperation,
        record: &Record,
    ) -> Result<DecodedMutation, Error> {
        let keys = self.mutation_keys(&record.key_id)?;

        if record.value_blob.len() < VALUE_MAC_SIZE {
            return Err(Error::integrity(category, "mutation value too short"));
        }
        let (blob, value_mac) = record
            .value_blob
            .split_at(record.value_blob.len() - VALUE_MAC_SIZE);

        let expected = keys.value_mac(operation, blob, &record.key_id)?;
        if expected.as_slice() != value_mac {
            return Err(Error::integrity(category, "value MAC mismatch"));
        }

        let plaintext = keys.decrypt(blob)?;
        let data = SyncActionData::decode(plaintext.as_slice())?;

        let index_mac = keys.index_mac(&data.index)?;
        if index_mac.as_slice() != record.index_mac.as_slice() {
            return Err(Error::integrity(category, "index MAC mismatch"));
        }

        Ok(DecodedMutation {
            operation,
            index: MessageIndex::from_json(&data.index)?,
            value: data.value.unwrap_or_default(),
            value_mac: value_mac.to_vec(),
        })
    }

    fn commit(
        &self,
        category: PatchType,
        state: HashChainState,
        decoded: Vec<DecodedMutation>,
    ) -> Vec<AppStateEvent> {
        self.keys.put_hash_chain_state(category, state);

        let mut events = Vec::with_capacity(decoded.len());
        for mutation in decoded {
            let Some(action) = SyncAction::resolve(&mutation.index, &mutation.value) else {
                debug!(%category, index = ?mutation.index.parts(), "Skipping unsupported mutation");
                continue;
            };

            if mutation.operation == MutationOperation::Set {
                self.store
                    .apply_sync_action(&mutation.index, &action, mutation.value.timestamp);
            }

            let event = AppStateEvent {
                category,
                operation: mutation.operation,
                index: mutation.index,
                action,
                timestamp: mutation.value.timestamp,
            };
            for listener in &self.listeners {
                listener.on_event(&event);
            }
            events.push(event);
        }

        if let Some(persistence) = &self.persistence {
            persistence.serialize_keys(&self.keys, WriteMode::Async);
            persistence.serialize_store(&self.store, WriteMode::Async);
        }

        events
    }

    /// Encrypts `mutations` into a patch for the next version of `category`.
    ///
    /// The MACs are computed against a copy of the local hash state; the
    /// local state itself only advances when the server sends the patch back.
    pub fn build_patch(
        &self,
        category: PatchType,
        mutations: &[PendingMutation],
        timestamp: i64,
    ) -> Result<PatchRequest, Error> {
        let key = self.keys.latest_app_state_key()?;
        let keys = key.mutation_keys()?;

        let slot = self.slot(category);
        let _work = slot.work.lock();
        let mut state = self.keys.hash_chain_state(category).unwrap_or_default();

        let mut records = Vec::with_capacity(mutations.len());
        let mut indexes = Vec::with_capacity(mutations.len());
        let mut value_macs = Vec::with_capacity(mutations.len());
        for mutation in mutations {
            let index = mutation.action.index(&mutation.target)?;
            let index_json = index.to_json()?;
            let data = SyncActionData {
                index: index_json.clone(),
                value: Some(mutation.action.to_value(timestamp)),
                padding: Vec::new(),
                version: SYNC_ACTION_DATA_VERSION,
            };

            let blob = keys.encrypt(&data.encode_to_vec())?;
            let value_mac = keys.value_mac(mutation.operation, &blob, &key.key_id)?;
            let index_mac = keys.index_mac(&index_json)?;
            state.mix(category, mutation.operation, &index_mac, &value_mac)?;

            records.push(Mutation {
                operation: mutation.operation.to_wire(),
                record: Some(Record {
                    index_mac: index_mac.to_vec(),
                    value_blob: [blob.as_slice(), value_mac.as_slice()].concat(),
                    key_id: key.key_id.clone(),
                }),
            });
            indexes.push(index);
            value_macs.push(value_mac);
        }

        state.version += 1;
        let snapshot_mac = keys.snapshot_mac(&state.hash, state.version, category.name())?;
        let value_macs: Vec<&[u8]> = value_macs.iter().map(|mac| mac.as_slice()).collect();
        let patch_mac = keys.patch_mac(&snapshot_mac, &value_macs, state.version, category.name())?;

        debug!(%category, version = state.version, key = %key.display_id(), "Built app state patch");
        Ok(PatchRequest {
            category,
            indexes,
            patch: Patch {
                version: state.version,
                mutations: records,
                snapshot_mac: snapshot_mac.to_vec(),
                patch_mac: patch_mac.to_vec(),
                key_id: key.key_id.clone(),
            },
        })
    }

    /// Builds a patch and pushes it, resolving on the server's
    /// acknowledgement.
    pub async fn submit(
        &self,
        transport: &dyn PatchTransport,
        category: PatchType,
        mutations: &[PendingMutation],
        timestamp: i64,
    ) -> Result<PatchAck, Error> {
        let request = self.build_patch(category, mutations, timestamp)?;
        let ack = transport.push(request).await?;
        info!(%category, version = ack.version, "App state patch acknowledged");
        Ok(ack)
    }
}
