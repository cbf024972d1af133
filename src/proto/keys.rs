use super::messages::{
    AppStateKeyProto, CompanionProto, HashStateProto, IndexValueProto, KeyStoreConfigProto,
    KeysProto, PreKeyProto, SenderKeyProto, SenderKeyStateProto, SessionProto, SignedPreKeyProto,
};
use super::{SCHEMA_VERSION, array, check_version};
use crate::{
    AppStateSyncKey, ClientType, CompanionIdentity, Error, HashChainState, IdentityKeyPair,
    KeyPair, KeyStore, KeyStoreConfig, LT_HASH_SIZE, PatchType, PreKeyPair, SenderKeyName,
    SenderKeyRecord, SenderKeyState, SessionAddress, SessionRecord, SignedPreKeyPair,
};
use prost::Message;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

impl KeyStore {
    /// Serializes the key store to Protocol Buffers format.
    ///
    /// Map entries are written in sorted order so that equal stores encode to
    /// equal bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let signed_pre_key = self.signed_pre_key();

        let pre_keys = self
            .pre_keys()
            .into_iter()
            .map(|pre_key| PreKeyProto {
                id: pre_key.id(),
                private_key: pre_key.key_pair().private_key().to_vec(),
            })
            .collect();

        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| SessionProto {
                name: entry.key().name().to_string(),
                device_id: entry.key().device_id(),
                record: entry.value().as_bytes().to_vec(),
            })
            .collect();
        sessions.sort_by(|a, b| (&a.name, a.device_id).cmp(&(&b.name, b.device_id)));

        let mut sender_keys: Vec<_> = self
            .sender_keys
            .iter()
            .map(|entry| SenderKeyProto {
                group_id: entry.key().group_id().to_string(),
                sender_name: entry.key().sender().name().to_string(),
                sender_device_id: entry.key().sender().device_id(),
                states: entry
                    .value()
                    .states()
                    .iter()
                    .map(|state| SenderKeyStateProto {
                        key_id: state.key_id,
                        iteration: state.iteration,
                        chain_key: state.chain_key.to_vec(),
                        signing_public_key: state.signing_public_key.to_vec(),
                    })
                    .collect(),
            })
            .collect();
        sender_keys.sort_by(|a, b| {
            (&a.group_id, &a.sender_name, a.sender_device_id).cmp(&(
                &b.group_id,
                &b.sender_name,
                b.sender_device_id,
            ))
        });

        let app_state_keys = self
            .app_state_keys()
            .iter()
            .map(|key| AppStateKeyProto {
                key_id: key.key_id.clone(),
                key_data: key.key_data.clone(),
                timestamp: key.timestamp,
            })
            .collect();

        let mut hash_states: Vec<_> = self
            .hash_states
            .iter()
            .map(|entry| HashStateProto {
                category: entry.key().name().to_string(),
                version: entry.value().version,
                hash: entry.value().hash.to_vec(),
                entries: entry
                    .value()
                    .index_value_map
                    .iter()
                    .map(|(index_mac, value_mac)| IndexValueProto {
                        index_mac: index_mac.clone(),
                        value_mac: value_mac.clone(),
                    })
                    .collect(),
            })
            .collect();
        hash_states.sort_by(|a, b| a.category.cmp(&b.category));

        let companion = self.companion_identity().map(|identity| CompanionProto {
            details: identity.details,
            account_signature_key: identity.account_signature_key.to_vec(),
            account_signature: identity.account_signature.to_vec(),
            device_signature: identity.device_signature.map(|signature| signature.to_vec()),
        });

        let keys_proto = KeysProto {
            version: SCHEMA_VERSION,
            uuid: self.uuid.to_string(),
            client_type: self.client_type.to_proto(),
            registration_id: self.registration_id,
            noise_key: self.noise_key_pair.private_key().to_vec(),
            ephemeral_key: self.ephemeral_key_pair.private_key().to_vec(),
            identity_key: self.identity_key_pair.to_bytes().to_vec(),
            signed_pre_key: Some(SignedPreKeyProto {
                id: signed_pre_key.id(),
                private_key: signed_pre_key.key_pair().private_key().to_vec(),
                signature: signed_pre_key.signature().to_vec(),
            }),
            signed_pre_key_rotated_at: self.signed_pre_key_rotated_at.load(Ordering::Acquire),
            last_pre_key_id: self.last_pre_key_id(),
            pre_keys,
            sessions,
            sender_keys,
            app_state_keys,
            hash_states,
            companion,
            config: Some(KeyStoreConfigProto {
                pre_key_batch: self.config.pre_key_batch,
                signed_pre_key_rotation_interval_secs: self
                    .config
                    .signed_pre_key_rotation_interval
                    .as_secs(),
            }),
        };

        Ok(keys_proto.encode_to_vec())
    }

    /// Deserializes a key store from Protocol Buffers format.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let keys_proto = KeysProto::decode(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode keys: {err:?}")))?;
        check_version(keys_proto.version, "keys")?;

        let uuid = Uuid::parse_str(&keys_proto.uuid)
            .map_err(|err| Error::Serde(format!("Invalid uuid: {err}")))?;
        let client_type = ClientType::from_proto(keys_proto.client_type).ok_or_else(|| {
            Error::Serde(format!("Unknown client type: {}", keys_proto.client_type))
        })?;

        let config = match keys_proto.config {
            Some(config) => KeyStoreConfig {
                pre_key_batch: config.pre_key_batch,
                signed_pre_key_rotation_interval: Duration::from_secs(
                    config.signed_pre_key_rotation_interval_secs,
                ),
            },
            None => return Err(Error::Serde("Missing key store config".to_string())),
        };

        let signed_pre_key = match keys_proto.signed_pre_key {
            Some(signed_pre_key) => SignedPreKeyPair::from_parts(
                signed_pre_key.id,
                KeyPair::from(array::<32>(&signed_pre_key.private_key, "signed pre-key")?),
                array::<64>(&signed_pre_key.signature, "signed pre-key signature")?,
            ),
            None => return Err(Error::Serde("Missing signed pre-key".to_string())),
        };

        let keys = KeyStore::from_parts(
            uuid,
            client_type,
            config,
            keys_proto.registration_id,
            KeyPair::from(array::<32>(&keys_proto.noise_key, "noise key")?),
            KeyPair::from(array::<32>(&keys_proto.ephemeral_key, "ephemeral key")?),
            IdentityKeyPair::from(array::<64>(&keys_proto.identity_key, "identity key")?),
            signed_pre_key,
            keys_proto.signed_pre_key_rotated_at,
            keys_proto.last_pre_key_id,
        );

        for pre_key in keys_proto.pre_keys {
            let key_pair = KeyPair::from(array::<32>(&pre_key.private_key, "pre-key")?);
            keys.pre_keys
                .insert(pre_key.id, PreKeyPair::new(pre_key.id, key_pair));
        }

        for session in keys_proto.sessions {
            keys.sessions.insert(
                SessionAddress::new(session.name, session.device_id),
                SessionRecord::new(session.record),
            );
        }

        for sender_key in keys_proto.sender_keys {
            let record = SenderKeyRecord::new();
            for state in sender_key.states {
                record.add_state(SenderKeyState {
                    key_id: state.key_id,
                    iteration: state.iteration,
                    chain_key: array::<32>(&state.chain_key, "sender chain key")?,
                    signing_public_key: array::<32>(
                        &state.signing_public_key,
                        "sender signing key",
                    )?,
                });
            }
            let name = SenderKeyName::new(
                sender_key.group_id,
                SessionAddress::new(sender_key.sender_name, sender_key.sender_device_id),
            );
            keys.sender_keys.insert(name, Arc::new(record));
        }

        *keys.app_state_keys.write() = keys_proto
            .app_state_keys
            .into_iter()
            .map(|key| AppStateSyncKey::new(key.key_id, key.key_data, key.timestamp))
            .collect();

        for state in keys_proto.hash_states {
            let category: PatchType = state.category.parse()?;
            let hash_state = HashChainState {
                version: state.version,
                hash: array::<LT_HASH_SIZE>(&state.hash, "hash chain state")?,
                index_value_map: state
                    .entries
                    .into_iter()
                    .map(|entry| (entry.index_mac, entry.value_mac))
                    .collect(),
            };
            keys.hash_states.insert(category, hash_state);
        }

        if let Some(companion) = keys_proto.companion {
            let device_signature = match companion.device_signature {
                Some(signature) => Some(array::<64>(&signature, "device signature")?),
                None => None,
            };
            *keys.companion_identity.write() = Some(CompanionIdentity {
                details: companion.details,
                account_signature_key: array::<32>(
                    &companion.account_signature_key,
                    "account signature key",
                )?,
                account_signature: array::<64>(&companion.account_signature, "account signature")?,
                device_signature,
            });
        }

        Ok(keys)
    }
}
