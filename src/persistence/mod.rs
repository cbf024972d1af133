mod layout;
use layout::{EntryKind, Layout, entry_jid, parse_entry};

mod task;
pub use task::*;

use crate::proto::{decode_chat, decode_newsletter, encode_chat, encode_newsletter};
use crate::{
    Chat, ClientType, Error, Identity, IdentityLookup, KeyStore, KeyStoreConfig, Newsletter,
    PersistenceConfig, Store, ensure_paired,
};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::ReentrantMutex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Entity {
    Keys,
    Store,
}

enum LoadedEntry {
    Chat(Chat),
    Newsletter(Newsletter),
    PlaceholderChat(Chat),
    PlaceholderNewsletter(Newsletter),
    Dropped,
}

struct Inner {
    layout: Layout,
    /// SHA-256 of the bytes last written to or read from each path.
    fingerprints: DashMap<PathBuf, [u8; 32]>,
    /// Revision of each entity at its last successful write.
    revisions: DashMap<(Uuid, Entity), u64>,
    locks: DashMap<Uuid, Arc<ReentrantMutex<()>>>,
    attributions: DashMap<Uuid, AttributeTask>,
    physical_writes: AtomicU64,
}

/// Durable, change-detecting storage of key stores and conversation stores.
///
/// All operations on one identity are serialized by a per-identity reentrant
/// lock. Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct PersistenceController {
    runtime: Handle,
    inner: Arc<Inner>,
}

impl PersistenceController {
    /// Async writes and attribution run on `runtime`.
    pub fn new(config: PersistenceConfig, runtime: Handle) -> Self {
        Self {
            runtime,
            inner: Arc::new(Inner {
                layout: Layout::new(config.base_directory),
                fingerprints: DashMap::new(),
                revisions: DashMap::new(),
                locks: DashMap::new(),
                attributions: DashMap::new(),
                physical_writes: AtomicU64::new(0),
            }),
        }
    }

    pub fn base_directory(&self) -> &Path {
        self.inner.layout.base()
    }

    /// Number of files replaced on disk since creation.
    pub fn physical_writes(&self) -> u64 {
        self.inner.physical_writes.load(Ordering::Acquire)
    }

    pub fn serialize_keys(&self, keys: &Arc<KeyStore>, mode: WriteMode) -> WriteTask {
        match mode {
            WriteMode::Sync => WriteTask::Completed(self.inner.write_keys(keys)),
            WriteMode::Async => {
                let inner = self.inner.clone();
                let keys = keys.clone();
                WriteTask::Pending(self.runtime.spawn_blocking(move || inner.write_keys(&keys)))
            }
        }
    }

    /// Writes the store's own fields and every changed chat and newsletter.
    ///
    /// Skipped while the store's conversations are still being attributed.
    pub fn serialize_store(&self, store: &Arc<Store>, mode: WriteMode) -> WriteTask {
        match mode {
            WriteMode::Sync => WriteTask::Completed(self.inner.write_store(store)),
            WriteMode::Async => {
                let inner = self.inner.clone();
                let store = store.clone();
                WriteTask::Pending(self.runtime.spawn_blocking(move || inner.write_store(&store)))
            }
        }
    }

    /// Loads the key store matching `lookup`, or `None` if there is none.
    ///
    /// A keys file that cannot be read or decoded is a storage fault.
    pub fn deserialize_keys(
        &self,
        client_type: ClientType,
        lookup: &IdentityLookup,
    ) -> Result<Option<KeyStore>, Error> {
        let Some(uuid) = self.inner.resolve(client_type, lookup) else {
            return Ok(None);
        };
        let lock = self.inner.lock(uuid);
        let _guard = lock.lock();

        let path = self.inner.layout.keys_file(client_type, uuid);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let keys = KeyStore::deserialize(&bytes).map_err(|err| corrupt(&path, &err))?;
        if keys.uuid() != uuid {
            return Err(Error::Storage(format!(
                "Keys file {} belongs to {}",
                path.display(),
                keys.uuid()
            )));
        }

        self.inner.fingerprints.insert(path, fingerprint(&bytes));
        self.inner
            .revisions
            .insert((uuid, Entity::Keys), keys.revision());
        info!(%uuid, %client_type, "Loaded key store");
        Ok(Some(keys))
    }

    /// Loads the store's own fields. Conversations are loaded separately by
    /// [`PersistenceController::attribute_store`].
    pub fn deserialize_store(
        &self,
        client_type: ClientType,
        lookup: &IdentityLookup,
    ) -> Result<Option<Store>, Error> {
        let Some(uuid) = self.inner.resolve(client_type, lookup) else {
            return Ok(None);
        };
        let lock = self.inner.lock(uuid);
        let _guard = lock.lock();

        let path = self.inner.layout.store_file(client_type, uuid);
        let Some(bytes) = read_optional(&path)? else {
            return Ok(None);
        };
        let store = Store::deserialize(&bytes).map_err(|err| corrupt(&path, &err))?;
        if store.uuid() != uuid {
            return Err(Error::Storage(format!(
                "Store file {} belongs to {}",
                path.display(),
                store.uuid()
            )));
        }

        self.inner.fingerprints.insert(path, fingerprint(&bytes));
        self.inner
            .revisions
            .insert((uuid, Entity::Store), store.revision());
        info!(%uuid, %client_type, "Loaded store");
        Ok(Some(store))
    }

    /// Loads the key store and store of one session together.
    ///
    /// Fails with [`Error::IdentityMismatch`] if the two halves belong to
    /// different sessions. When nothing is found the call fails with
    /// [`Error::UnknownIdentity`], unless `create_if_absent` is set, in which
    /// case the missing halves are created.
    pub fn load_pair(
        &self,
        client_type: ClientType,
        lookup: &IdentityLookup,
        create_if_absent: bool,
    ) -> Result<(Arc<KeyStore>, Arc<Store>), Error> {
        let keys = self.deserialize_keys(client_type, lookup)?;
        let store = self.deserialize_store(client_type, lookup)?;

        let (keys, store) = match (keys, store) {
            (Some(keys), Some(store)) => (keys, store),
            (Some(keys), None) if create_if_absent => {
                let identity = Identity {
                    uuid: keys.uuid(),
                    ..identity_for(client_type, lookup)
                };
                (keys, Store::new(identity))
            }
            (None, Some(store)) if create_if_absent => {
                let keys = KeyStore::random(store.uuid(), client_type, KeyStoreConfig::default())?;
                (keys, store)
            }
            (None, None) if create_if_absent => {
                let identity = identity_for(client_type, lookup);
                let keys = KeyStore::random(identity.uuid, client_type, KeyStoreConfig::default())?;
                (keys, Store::new(identity))
            }
            _ => return Err(Error::UnknownIdentity(lookup.to_string())),
        };

        ensure_paired(&keys, &store)?;
        Ok((Arc::new(keys), Arc::new(store)))
    }

    /// Starts loading every chat and newsletter file of `store` in the
    /// background.
    ///
    /// Each file loads on its own blocking task. A corrupt file is deleted
    /// and replaced with an empty placeholder. Quoted-message names are
    /// relinked once every file is in. Asking again while a load is in
    /// flight returns the same task.
    pub fn attribute_store(&self, store: &Arc<Store>) -> AttributeTask {
        let uuid = store.uuid();

        let task = match self.inner.attributions.entry(uuid) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => {
                let inner = self.inner.clone();
                let runtime = self.runtime.clone();
                let store = store.clone();
                let future = async move {
                    let result = inner.attribute(&runtime, &store).await;
                    inner.attributions.remove(&uuid);
                    result
                }
                .boxed()
                .shared();

                entry.insert(AttributeTask::new(future)).clone()
            }
        };

        let driver = task.clone();
        self.runtime.spawn(async move {
            if let Err(err) = driver.wait().await {
                error!(%uuid, error = %err, "Store attribution failed");
            }
        });
        task
    }

    /// Waits for the in-flight attribution of `uuid`, if any.
    ///
    /// Returns `None` when no attribution was running.
    pub async fn finish_deserialize_store(
        &self,
        uuid: Uuid,
    ) -> Result<Option<AttributionReport>, Error> {
        let task = self
            .inner
            .attributions
            .get(&uuid)
            .map(|task| task.value().clone());
        match task {
            Some(task) => task.wait().await.map(Some),
            None => Ok(None),
        }
    }

    /// Removes every file of `identity`, including the marker files pointing
    /// to it. Deleting a session that does not exist is not an error.
    pub fn delete_session(&self, identity: &Identity) -> Result<(), Error> {
        let uuid = identity.uuid;
        let lock = self.inner.lock(uuid);
        let _guard = lock.lock();

        let dir = self.inner.layout.session_dir(identity.client_type, uuid);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        let mut removed = Vec::new();
        let root = self.inner.layout.root(identity.client_type);
        for marker in list_files(&root)? {
            if read_marker(&marker) == Some(uuid) {
                remove_optional(&marker)?;
                removed.push(marker);
            }
        }

        self.inner
            .fingerprints
            .retain(|path, _| !path.starts_with(&dir) && !removed.contains(path));
        self.inner.revisions.remove(&(uuid, Entity::Keys));
        self.inner.revisions.remove(&(uuid, Entity::Store));

        info!(%uuid, client_type = %identity.client_type, markers = removed.len(), "Deleted session");
        Ok(())
    }

    /// Uuids of the sessions stored for `client_type`, least recently
    /// modified first.
    pub fn list_ids(&self, client_type: ClientType) -> Result<Vec<Uuid>, Error> {
        let root = self.inner.layout.root(client_type);
        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_dir() {
                continue;
            }
            let Some(uuid) = entry
                .file_name()
                .to_str()
                .and_then(|name| Uuid::parse_str(name).ok())
            else {
                continue;
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            ids.push((modified, uuid));
        }

        ids.sort();
        Ok(ids.into_iter().map(|(_, uuid)| uuid).collect())
    }
}

impl Inner {
    fn lock(&self, uuid: Uuid) -> Arc<ReentrantMutex<()>> {
        self.locks.entry(uuid).or_default().clone()
    }

    /// Tries the uuid, then the phone number marker, then each alias marker.
    fn resolve(&self, client_type: ClientType, lookup: &IdentityLookup) -> Option<Uuid> {
        let exists = |uuid: Uuid| self.layout.session_dir(client_type, uuid).is_dir();

        if let Some(uuid) = lookup.uuid.filter(|uuid| exists(*uuid)) {
            return Some(uuid);
        }

        let handles = lookup
            .phone_number
            .map(|phone_number| phone_number.to_string())
            .into_iter()
            .chain(lookup.alias.iter().cloned());
        for handle in handles {
            let Some(marker) = self.layout.marker(client_type, &handle) else {
                continue;
            };
            if let Some(uuid) = read_marker(&marker).filter(|uuid| exists(*uuid)) {
                debug!(%uuid, %handle, "Resolved session through marker");
                return Some(uuid);
            }
        }

        None
    }

    /// Replaces `path` with `bytes` unless they match what was last written
    /// or read there.
    fn write_if_changed(&self, path: &Path, bytes: &[u8]) -> Result<bool, Error> {
        let digest = fingerprint(bytes);
        if self
            .fingerprints
            .get(path)
            .is_some_and(|previous| *previous == digest)
        {
            return Ok(false);
        }

        let dir = path
            .parent()
            .ok_or_else(|| Error::Storage(format!("No parent directory for {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(bytes)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|err| Error::from(err.error))?;

        self.fingerprints.insert(path.to_path_buf(), digest);
        self.physical_writes.fetch_add(1, Ordering::AcqRel);
        debug!(path = %path.display(), size = bytes.len(), "Wrote file");
        Ok(true)
    }

    fn write_keys(&self, keys: &KeyStore) -> Result<WriteOutcome, Error> {
        let uuid = keys.uuid();
        let lock = self.lock(uuid);
        let _guard = lock.lock();

        let revision = keys.revision();
        if self.revisions.get(&(uuid, Entity::Keys)).as_deref() == Some(&revision) {
            return Ok(WriteOutcome::Skipped);
        }

        let path = self.layout.keys_file(keys.client_type(), uuid);
        let written = keys
            .serialize()
            .and_then(|bytes| self.write_if_changed(&path, &bytes))
            .inspect_err(|err| error!(%uuid, path = %path.display(), error = %err, "Cannot write keys"))?;

        self.revisions.insert((uuid, Entity::Keys), revision);
        Ok(if written {
            WriteOutcome::Written(1)
        } else {
            WriteOutcome::Skipped
        })
    }

    fn write_store(&self, store: &Store) -> Result<WriteOutcome, Error> {
        let identity = store.identity();
        let uuid = identity.uuid;
        if self.attributions.contains_key(&uuid) {
            debug!(%uuid, "Store write skipped while attribution is in flight");
            return Ok(WriteOutcome::Skipped);
        }

        let lock = self.lock(uuid);
        let _guard = lock.lock();

        let revision = store.revision();
        if self.revisions.get(&(uuid, Entity::Store)).as_deref() == Some(&revision) {
            return Ok(WriteOutcome::Skipped);
        }

        let written = self
            .write_store_files(store, &identity)
            .inspect_err(|err| error!(%uuid, error = %err, "Cannot write store"))?;

        self.revisions.insert((uuid, Entity::Store), revision);
        Ok(match written {
            0 => WriteOutcome::Skipped,
            written => WriteOutcome::Written(written),
        })
    }

    fn write_store_files(&self, store: &Store, identity: &Identity) -> Result<usize, Error> {
        let mut written = self.link_metadata(identity)?;
        let count = |changed: bool| usize::from(changed);

        let store_file = self.layout.store_file(identity.client_type, identity.uuid);
        written += count(self.write_if_changed(&store_file, &store.serialize()?)?);

        let dir = self.layout.session_dir(identity.client_type, identity.uuid);
        let mut live = HashSet::new();
        for chat in store.chats() {
            let path = self.layout.entry_file(&dir, EntryKind::Chat, &chat.jid);
            written += count(self.write_if_changed(&path, &encode_chat(&chat))?);
            live.insert(path);
        }
        for newsletter in store.newsletters() {
            let path = self
                .layout
                .entry_file(&dir, EntryKind::Newsletter, &newsletter.jid);
            written += count(self.write_if_changed(&path, &encode_newsletter(&newsletter))?);
            live.insert(path);
        }

        // Only a fully loaded store knows which files are stale.
        if store.is_attributed() {
            for path in list_files(&dir)? {
                let is_entry = file_name(&path).and_then(parse_entry).is_some();
                if is_entry && !live.contains(&path) {
                    remove_optional(&path)?;
                    self.fingerprints.remove(&path);
                    debug!(path = %path.display(), "Removed stale file");
                }
            }
        }

        Ok(written)
    }

    /// Writes a marker file for the phone number and each alias.
    fn link_metadata(&self, identity: &Identity) -> Result<usize, Error> {
        let lock = self.lock(identity.uuid);
        let _guard = lock.lock();

        let uuid = identity.uuid.to_string();
        let handles = identity
            .phone_number
            .map(|phone_number| phone_number.to_string())
            .into_iter()
            .chain(identity.alias.iter().cloned());

        let mut written = 0;
        for handle in handles {
            let Some(marker) = self.layout.marker(identity.client_type, &handle) else {
                continue;
            };
            if self.write_if_changed(&marker, uuid.as_bytes())? {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn attribute(
        self: &Arc<Self>,
        runtime: &Handle,
        store: &Store,
    ) -> Result<AttributionReport, Error> {
        let identity = store.identity();
        let dir = self.layout.session_dir(identity.client_type, identity.uuid);

        let files = runtime
            .spawn_blocking({
                let dir = dir.clone();
                move || list_files(&dir)
            })
            .await
            .map_err(|err| Error::Storage(format!("Listing {} failed: {err}", dir.display())))??;

        let loads = files.into_iter().filter_map(|path| {
            let kind = file_name(&path).and_then(parse_entry)?;
            let inner = self.clone();
            Some(runtime.spawn_blocking(move || inner.load_entry(&path, kind)))
        });

        let mut report = AttributionReport::default();
        for result in join_all(loads).await {
            let loaded =
                result.map_err(|err| Error::Storage(format!("Loading a chat failed: {err}")))?;
            match loaded {
                LoadedEntry::Chat(chat) => {
                    store.restore_chat(chat);
                    report.loaded += 1;
                }
                LoadedEntry::Newsletter(newsletter) => {
                    store.restore_newsletter(newsletter);
                    report.loaded += 1;
                }
                LoadedEntry::PlaceholderChat(chat) => {
                    if store.find_chat(&chat.jid).is_none() {
                        store.add_chat(chat);
                    }
                    report.rescued += 1;
                }
                LoadedEntry::PlaceholderNewsletter(newsletter) => {
                    if store.find_newsletter(&newsletter.jid).is_none() {
                        store.add_newsletter(newsletter);
                    }
                    report.rescued += 1;
                }
                LoadedEntry::Dropped => report.rescued += 1,
            }
        }

        store.relink_contexts();
        store.set_attributed(true);
        info!(
            uuid = %identity.uuid,
            loaded = report.loaded,
            rescued = report.rescued,
            "Attributed store"
        );
        Ok(report)
    }

    /// Loads one conversation file. Never fails: a file that cannot be read
    /// or decoded is deleted and replaced with a placeholder named after it.
    fn load_entry(&self, path: &Path, kind: EntryKind) -> LoadedEntry {
        let decoded = fs::read(path).map_err(Error::from).and_then(|bytes| {
            let entry = match kind {
                EntryKind::Chat => LoadedEntry::Chat(decode_chat(&bytes)?),
                EntryKind::Newsletter => LoadedEntry::Newsletter(decode_newsletter(&bytes)?),
            };
            self.fingerprints
                .insert(path.to_path_buf(), fingerprint(&bytes));
            Ok(entry)
        });

        match decoded {
            Ok(entry) => entry,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Replacing unreadable file with a placeholder");
                if let Err(err) = remove_optional(path) {
                    warn!(path = %path.display(), error = %err, "Cannot remove unreadable file");
                }
                self.fingerprints.remove(path);

                let jid = file_name(path).and_then(|name| entry_jid(name, kind));
                match (kind, jid) {
                    (EntryKind::Chat, Some(jid)) => LoadedEntry::PlaceholderChat(Chat::new(jid)),
                    (EntryKind::Newsletter, Some(jid)) => {
                        LoadedEntry::PlaceholderNewsletter(Newsletter::new(jid))
                    }
                    (_, None) => LoadedEntry::Dropped,
                }
            }
        }
    }
}

fn identity_for(client_type: ClientType, lookup: &IdentityLookup) -> Identity {
    Identity {
        uuid: lookup.uuid.unwrap_or_else(Uuid::new_v4),
        phone_number: lookup.phone_number,
        alias: lookup.alias.clone(),
        client_type,
    }
}

fn fingerprint(bytes: &[u8]) -> [u8; 32] {
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(bytes));
    digest
}

fn corrupt(path: &Path, err: &Error) -> Error {
    Error::Storage(format!("Corrupt file {}: {err}", path.display()))
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn remove_optional(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn read_marker(path: &Path) -> Option<Uuid> {
    let content = fs::read_to_string(path).ok()?;
    Uuid::parse_str(content.trim()).ok()
}

/// Regular files directly inside `dir`; a missing directory has none.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>, Error> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    Ok(files)
}
