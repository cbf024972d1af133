#[cfg(test)]
mod integration_tests {
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use companion_state::{
        Action, ActionTarget, AppStateConfig, AppStatePatchEngine, AppStateSyncKey, Chat,
        ChatMute, ClientType, ContextInfo, Error, Identity, IdentityLookup, Jid, KeyStore,
        KeyStoreConfig, MessageIndex, MessageInfo, Patch, PatchAck, PatchRequest, PatchTransport, PatchType,
        PendingMutation, PersistenceConfig, PersistenceController, SessionAddress, SessionRecord,
        Snapshot, Store, SyncAction, SyncStatus, WriteMode, WriteOutcome,
    };
    use parking_lot::Mutex;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::runtime::Handle;

    fn controller(dir: &TempDir) -> PersistenceController {
        PersistenceController::new(PersistenceConfig::at(dir.path()), Handle::current())
    }

    fn session(identity: Identity) -> (Arc<KeyStore>, Arc<Store>) {
        let keys = KeyStore::random(
            identity.uuid,
            identity.client_type,
            KeyStoreConfig::default(),
        )
        .unwrap();
        (Arc::new(keys), Arc::new(Store::new(identity)))
    }

    fn engine(sync_key: &AppStateSyncKey) -> AppStatePatchEngine {
        let (keys, store) = session(Identity::web());
        keys.add_app_state_keys([sync_key.clone()]);
        AppStatePatchEngine::new(AppStateConfig::default(), keys, store, Vec::new()).unwrap()
    }

    fn mute(jid: &Jid, end_timestamp: i64) -> PendingMutation {
        PendingMutation::set(
            SyncAction::Action(Action::Mute {
                muted: true,
                end_timestamp,
            }),
            ActionTarget::Chat(jid.clone()),
        )
    }

    /// File name a chat or marker handle is stored under.
    fn encoded(name: &str) -> String {
        URL_SAFE_NO_PAD.encode(name)
    }

    /// Plays the server: builds the next patch and feeds it back to the
    /// device that produced it.
    fn next_patch(sender: &AppStatePatchEngine, mutation: PendingMutation) -> Patch {
        let request = sender
            .build_patch(PatchType::Regular, &[mutation], 1_700_000_000)
            .unwrap();
        sender
            .apply_patches(PatchType::Regular, &[request.patch.clone()])
            .unwrap();
        request.patch
    }

    #[tokio::test]
    async fn test_keys_survive_a_restart() {
        let dir = TempDir::new().unwrap();
        let identity = Identity::web();
        let (keys, _) = session(identity.clone());
        keys.generate_pre_keys(5).unwrap();
        keys.put_session(
            SessionAddress::new("15550001111", 0),
            SessionRecord::new(vec![1, 2, 3]),
        );
        keys.add_app_state_keys([AppStateSyncKey::random(10).unwrap()]);

        let outcome = controller(&dir)
            .serialize_keys(&keys, WriteMode::Sync)
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(1));

        let restored = controller(&dir)
            .deserialize_keys(ClientType::Web, &identity.lookup())
            .unwrap()
            .unwrap();
        assert_eq!(restored.uuid(), keys.uuid());
        assert_eq!(restored.identity_key_pair(), keys.identity_key_pair());
        assert_eq!(restored.pre_keys(), keys.pre_keys());
        assert_eq!(restored.app_state_keys(), keys.app_state_keys());
        assert_eq!(
            restored.find_session(&SessionAddress::new("15550001111", 0)),
            Some(SessionRecord::new(vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn test_unchanged_keys_are_written_once() {
        let dir = TempDir::new().unwrap();
        let persistence = controller(&dir);
        let (keys, _) = session(Identity::web());

        for _ in 0..3 {
            persistence
                .serialize_keys(&keys, WriteMode::Sync)
                .wait()
                .await
                .unwrap();
        }
        assert_eq!(persistence.physical_writes(), 1);

        // A bumped revision with identical content is caught by the fingerprint.
        keys.mark_dirty();
        let outcome = persistence
            .serialize_keys(&keys, WriteMode::Async)
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Skipped);
        assert_eq!(persistence.physical_writes(), 1);

        keys.generate_pre_keys(1).unwrap();
        let outcome = persistence
            .serialize_keys(&keys, WriteMode::Sync)
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(1));
        assert_eq!(persistence.physical_writes(), 2);
    }

    #[test]
    fn test_patches_accepted_in_order() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let receiver = engine(&key);

        let patches: Vec<_> = (1..=3)
            .map(|n| next_patch(&sender, mute(&Jid::user_jid(n), n as i64 * 100)))
            .collect();

        let events = receiver
            .apply_patches(PatchType::Regular, &patches)
            .unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(
            receiver.status(PatchType::Regular),
            SyncStatus::Synced { version: 3 }
        );
        assert_eq!(
            receiver.status(PatchType::Regular),
            sender.status(PatchType::Regular)
        );
    }

    #[test]
    fn test_out_of_order_patches_are_rejected() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let receiver = engine(&key);

        let mut patches: Vec<_> = (1..=3)
            .map(|n| next_patch(&sender, mute(&Jid::user_jid(n), 0)))
            .collect();
        patches.swap(1, 2);

        let result = receiver.apply_patches(PatchType::Regular, &patches);
        assert!(matches!(
            result,
            Err(Error::IntegrityViolation {
                category: PatchType::Regular,
                ..
            })
        ));
        assert_eq!(receiver.status(PatchType::Regular), SyncStatus::Corrupted);
        assert!(receiver.status(PatchType::RegularHigh) != SyncStatus::Corrupted);
    }

    #[test]
    fn test_flipped_payload_byte_is_rejected() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let receiver = engine(&key);
        let jid = Jid::user_jid(42);

        let mut patch = next_patch(&sender, mute(&jid, 0));
        let record = patch.mutations[0].record.as_mut().unwrap();
        let last = record.value_blob.len() - 1;
        record.value_blob[last] ^= 0x01;

        assert!(receiver.apply_patches(PatchType::Regular, &[patch]).is_err());
        assert_eq!(receiver.status(PatchType::Regular), SyncStatus::Corrupted);
    }

    #[test]
    fn test_duplicate_mute_converges() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let (keys, store) = session(Identity::web());
        keys.add_app_state_keys([key.clone()]);
        let receiver =
            AppStatePatchEngine::new(AppStateConfig::default(), keys, store.clone(), Vec::new())
                .unwrap();

        let jid = Jid::user_jid(15550009999);
        let first = next_patch(&sender, mute(&jid, 1_800_000_000));
        let second = next_patch(&sender, mute(&jid, 1_800_000_000));

        receiver
            .apply_patches(PatchType::Regular, &[first])
            .unwrap();
        let once = store.find_chat(&jid).unwrap();
        receiver
            .apply_patches(PatchType::Regular, &[second])
            .unwrap();

        assert_eq!(store.find_chat(&jid).unwrap(), once);
        assert_eq!(once.mute, ChatMute::Until(1_800_000_000));
        assert_eq!(
            receiver.status(PatchType::Regular),
            SyncStatus::Synced { version: 2 }
        );
    }

    #[test]
    fn test_bad_snapshot_mac_leaves_state_untouched() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let (keys, store) = session(Identity::web());
        keys.add_app_state_keys([key.clone()]);
        let receiver = AppStatePatchEngine::new(
            AppStateConfig::default(),
            keys.clone(),
            store.clone(),
            Vec::new(),
        )
        .unwrap();

        let history: Vec<_> = (1..=5)
            .map(|n| next_patch(&sender, mute(&Jid::user_jid(n), 0)))
            .collect();
        receiver
            .apply_patches(PatchType::Regular, &history)
            .unwrap();
        let state = keys.hash_chain_state(PatchType::Regular).unwrap();
        assert_eq!(state.version, 5);

        let archived = Jid::user_jid(6);
        let mut patch = sender
            .build_patch(
                PatchType::Regular,
                &[PendingMutation::set(
                    SyncAction::Action(Action::Archive { archived: true }),
                    ActionTarget::Chat(archived.clone()),
                )],
                1,
            )
            .unwrap()
            .patch;
        patch.snapshot_mac[0] ^= 0xff;

        let result = receiver.apply_patches(PatchType::Regular, &[patch]);
        assert!(matches!(result, Err(Error::IntegrityViolation { .. })));
        assert_eq!(receiver.status(PatchType::Regular), SyncStatus::Corrupted);
        assert_eq!(keys.hash_chain_state(PatchType::Regular), Some(state));
        assert!(store.find_chat(&archived).is_none());

        receiver.reset_for_resync(PatchType::Regular);
        receiver
            .apply_patches(PatchType::Regular, &history)
            .unwrap();
        assert_eq!(
            receiver.status(PatchType::Regular),
            SyncStatus::Synced { version: 5 }
        );
    }

    #[test]
    fn test_redelivered_patch_is_a_no_op() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let (keys, store) = session(Identity::web());
        keys.add_app_state_keys([key.clone()]);
        let receiver = AppStatePatchEngine::new(
            AppStateConfig::default(),
            keys.clone(),
            store.clone(),
            Vec::new(),
        )
        .unwrap();

        let jid = Jid::user_jid(15550008888);
        let patch = next_patch(&sender, mute(&jid, 1_800_000_000));

        receiver
            .apply_patches(PatchType::Regular, &[patch.clone()])
            .unwrap();
        let state = keys.hash_chain_state(PatchType::Regular);
        let revision = store.revision();

        let events = receiver
            .apply_patches(PatchType::Regular, &[patch])
            .unwrap();
        assert!(events.is_empty());
        assert_eq!(keys.hash_chain_state(PatchType::Regular), state);
        assert_eq!(store.revision(), revision);
        assert_eq!(
            receiver.status(PatchType::Regular),
            SyncStatus::Synced { version: 1 }
        );
    }

    #[test]
    fn test_older_snapshot_after_newer_state_is_ignored() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let (keys, store) = session(Identity::web());
        keys.add_app_state_keys([key.clone()]);
        let receiver = AppStatePatchEngine::new(
            AppStateConfig::default(),
            keys.clone(),
            store.clone(),
            Vec::new(),
        )
        .unwrap();

        let jid = Jid::user_jid(15550007777);
        let history: Vec<_> = (1..=3)
            .map(|n| next_patch(&sender, mute(&jid, n * 100)))
            .collect();
        receiver
            .apply_patches(PatchType::Regular, &history)
            .unwrap();
        let state = keys.hash_chain_state(PatchType::Regular);

        let stale = Snapshot {
            version: 2,
            records: Vec::new(),
            mac: vec![0; 32],
            key_id: key.key_id.clone(),
        };
        let events = receiver
            .apply_snapshot(PatchType::Regular, &stale)
            .unwrap();

        assert!(events.is_empty());
        assert_eq!(keys.hash_chain_state(PatchType::Regular), state);
        assert_eq!(
            receiver.status(PatchType::Regular),
            SyncStatus::Synced { version: 3 }
        );
        assert_eq!(
            store.find_chat(&jid).map(|chat| chat.mute),
            Some(ChatMute::Until(300))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_attribution_loads_every_chat_and_rescues_corrupt_ones() {
        let dir = TempDir::new().unwrap();
        let identity = Identity::web();
        let store = Arc::new(Store::new(identity.clone()));

        let quoted = Jid::group("120363000000000001");
        store.add_chat(Chat {
            name: Some("Climbing".to_string()),
            ..Chat::new(quoted.clone())
        });
        for n in 1..=20 {
            store.add_message(
                &Jid::user_jid(n),
                MessageInfo {
                    id: format!("m{n}"),
                    timestamp: n as i64,
                    context: Some(ContextInfo {
                        quoted_message_id: "q".to_string(),
                        quoted_chat: Some(quoted.clone()),
                        ..ContextInfo::default()
                    }),
                    ..MessageInfo::default()
                },
            );
        }
        controller(&dir)
            .serialize_store(&store, WriteMode::Sync)
            .wait()
            .await
            .unwrap();

        let session_dir = dir.path().join("web").join(identity.uuid.to_string());
        let corrupt = session_dir.join(format!("chat_{}.proto", encoded("7@s.whatsapp.net")));
        assert!(corrupt.exists());
        fs::write(&corrupt, b"\xff\xff\xff").unwrap();

        let persistence = controller(&dir);
        let loaded = Arc::new(
            persistence
                .deserialize_store(ClientType::Web, &identity.lookup())
                .unwrap()
                .unwrap(),
        );
        assert!(!loaded.is_attributed());

        let task = persistence.attribute_store(&loaded);
        let again = persistence.attribute_store(&loaded);
        let report = task.wait().await.unwrap();
        assert_eq!(again.wait().await.unwrap(), report);
        persistence
            .finish_deserialize_store(identity.uuid)
            .await
            .unwrap();

        assert_eq!(report.loaded, 20);
        assert_eq!(report.rescued, 1);
        assert!(loaded.is_attributed());
        assert_eq!(loaded.chat_count(), 21);
        assert_eq!(
            loaded.find_chat(&Jid::user_jid(7)).map(|chat| chat.messages.len()),
            Some(0)
        );
        assert!(!corrupt.exists());

        let context = loaded
            .find_message(&Jid::user_jid(3), "m3")
            .and_then(|message| message.context)
            .unwrap();
        assert_eq!(context.quoted_chat_name.as_deref(), Some("Climbing"));

        // Only the placeholder needs writing.
        let outcome = persistence
            .serialize_store(&loaded, WriteMode::Sync)
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written(1));
        assert!(corrupt.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_action_during_load_keeps_chat_history() {
        let dir = TempDir::new().unwrap();
        let identity = Identity::web();
        let store = Arc::new(Store::new(identity.clone()));
        let jid = Jid::user_jid(15550003333);
        for n in 1..=3 {
            store.add_message(
                &jid,
                MessageInfo {
                    id: format!("m{n}"),
                    timestamp: n,
                    ..MessageInfo::default()
                },
            );
        }
        controller(&dir)
            .serialize_store(&store, WriteMode::Sync)
            .wait()
            .await
            .unwrap();

        let persistence = controller(&dir);
        let loaded = Arc::new(
            persistence
                .deserialize_store(ClientType::Web, &identity.lookup())
                .unwrap()
                .unwrap(),
        );
        loaded.apply_sync_action(
            &MessageIndex::new(vec!["mute".to_string(), jid.to_string()]),
            &SyncAction::Action(Action::Mute {
                muted: true,
                end_timestamp: 1_900_000_000,
            }),
            1,
        );
        persistence.attribute_store(&loaded).wait().await.unwrap();
        persistence
            .serialize_store(&loaded, WriteMode::Sync)
            .wait()
            .await
            .unwrap();

        let persistence = controller(&dir);
        let reloaded = Arc::new(
            persistence
                .deserialize_store(ClientType::Web, &identity.lookup())
                .unwrap()
                .unwrap(),
        );
        persistence.attribute_store(&reloaded).wait().await.unwrap();

        let chat = reloaded.find_chat(&jid).unwrap();
        assert_eq!(chat.messages.len(), 3);
        assert_eq!(chat.mute, ChatMute::Until(1_900_000_000));
    }

    #[tokio::test]
    async fn test_lookup_by_phone_number_and_alias() {
        let dir = TempDir::new().unwrap();
        let persistence = controller(&dir);
        let identity = Identity::mobile(15550001234).with_alias("work");
        let (keys, store) = session(identity.clone());

        persistence
            .serialize_keys(&keys, WriteMode::Sync)
            .wait()
            .await
            .unwrap();
        persistence
            .serialize_store(&store, WriteMode::Sync)
            .wait()
            .await
            .unwrap();

        let by_phone = persistence
            .deserialize_keys(
                ClientType::Mobile,
                &IdentityLookup::by_phone_number(15550001234),
            )
            .unwrap();
        assert_eq!(by_phone.map(|keys| keys.uuid()), Some(identity.uuid));

        let (keys, store) = persistence
            .load_pair(ClientType::Mobile, &IdentityLookup::by_alias("work"), false)
            .unwrap();
        assert_eq!(keys.uuid(), identity.uuid);
        assert_eq!(store.identity(), identity);

        assert!(persistence
            .deserialize_store(ClientType::Mobile, &IdentityLookup::by_alias("home"))
            .unwrap()
            .is_none());
        assert!(persistence
            .deserialize_store(ClientType::Web, &identity.lookup())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_delete_session_removes_everything() {
        let dir = TempDir::new().unwrap();
        let persistence = controller(&dir);
        let identity = Identity::mobile(15550004321).with_alias("personal");
        let (keys, store) = session(identity.clone());
        store.add_chat(Chat::new(Jid::user_jid(1)));

        persistence
            .serialize_keys(&keys, WriteMode::Sync)
            .wait()
            .await
            .unwrap();
        persistence
            .serialize_store(&store, WriteMode::Sync)
            .wait()
            .await
            .unwrap();
        assert_eq!(
            persistence.list_ids(ClientType::Mobile).unwrap(),
            vec![identity.uuid]
        );

        persistence.delete_session(&identity).unwrap();

        let root = dir.path().join("mobile");
        assert!(!root.join(identity.uuid.to_string()).exists());
        assert!(!root.join(encoded("15550004321")).exists());
        assert!(!root.join(encoded("personal")).exists());
        assert!(persistence
            .deserialize_store(ClientType::Mobile, &identity.lookup())
            .unwrap()
            .is_none());
        assert!(persistence.list_ids(ClientType::Mobile).unwrap().is_empty());

        persistence.delete_session(&identity).unwrap();
    }

    #[tokio::test]
    async fn test_load_pair_creates_on_request() {
        let dir = TempDir::new().unwrap();
        let persistence = controller(&dir);
        let lookup = IdentityLookup::by_phone_number(15550005555);

        assert!(matches!(
            persistence.load_pair(ClientType::Mobile, &lookup, false),
            Err(Error::UnknownIdentity(_))
        ));

        let (keys, store) = persistence
            .load_pair(ClientType::Mobile, &lookup, true)
            .unwrap();
        assert_eq!(keys.uuid(), store.uuid());
        assert_eq!(store.identity().phone_number, Some(15550005555));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_committed_patches_reach_disk() {
        let dir = TempDir::new().unwrap();
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);

        let identity = Identity::web();
        let (keys, store) = session(identity.clone());
        keys.add_app_state_keys([key.clone()]);
        let persistence = controller(&dir);
        let receiver = AppStatePatchEngine::new(
            AppStateConfig::default(),
            keys.clone(),
            store.clone(),
            Vec::new(),
        )
        .unwrap()
        .with_persistence(persistence.clone());

        let patch = next_patch(&sender, mute(&Jid::user_jid(8), 0));
        receiver
            .apply_patches(PatchType::Regular, &[patch])
            .unwrap();

        persistence
            .serialize_keys(&keys, WriteMode::Sync)
            .wait()
            .await
            .unwrap();

        let restored = controller(&dir)
            .deserialize_keys(ClientType::Web, &identity.lookup())
            .unwrap()
            .unwrap();
        assert_eq!(
            restored.hash_chain_state(PatchType::Regular),
            keys.hash_chain_state(PatchType::Regular)
        );
    }

    #[test]
    fn test_mismatched_halves_are_refused() {
        let (keys, _) = session(Identity::web());
        let (_, store) = session(Identity::web());

        assert!(matches!(
            AppStatePatchEngine::new(AppStateConfig::default(), keys, store, Vec::new()),
            Err(Error::IdentityMismatch { .. })
        ));
    }

    /// Hands every pushed patch to another device, like the server fan-out.
    struct Loopback {
        peer: AppStatePatchEngine,
        pushed: Mutex<Vec<PatchRequest>>,
    }

    #[async_trait]
    impl PatchTransport for Loopback {
        async fn push(&self, request: PatchRequest) -> Result<PatchAck, Error> {
            self.peer
                .apply_patches(request.category, &[request.patch.clone()])?;
            let ack = PatchAck {
                category: request.category,
                version: request.patch.version,
            };
            self.pushed.lock().push(request);
            Ok(ack)
        }
    }

    #[tokio::test]
    async fn test_submitted_mutation_reaches_peer() {
        let key = AppStateSyncKey::random(1).unwrap();
        let sender = engine(&key);
        let transport = Loopback {
            peer: engine(&key),
            pushed: Mutex::new(Vec::new()),
        };
        let chat = Jid::user_jid(15550006666);

        let ack = sender
            .submit(
                &transport,
                PatchType::Regular,
                &[PendingMutation::set(
                    SyncAction::Action(Action::Archive { archived: true }),
                    ActionTarget::Chat(chat.clone()),
                )],
                1_700_000_000,
            )
            .await
            .unwrap();

        assert_eq!(ack.version, 1);
        assert_eq!(transport.pushed.lock().len(), 1);
        assert_eq!(
            transport.peer.status(PatchType::Regular),
            SyncStatus::Synced { version: 1 }
        );
        assert_eq!(
            sender.status(PatchType::Regular),
            SyncStatus::Synced { version: 0 }
        );
    }
}
