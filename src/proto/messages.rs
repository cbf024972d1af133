//! On-disk schema of persisted sessions.

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct KeysProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(int32, tag = "3")]
    pub client_type: i32,
    #[prost(uint32, tag = "4")]
    pub registration_id: u32,
    #[prost(bytes = "vec", tag = "5")]
    pub noise_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub ephemeral_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "7")]
    pub identity_key: Vec<u8>,
    #[prost(message, optional, tag = "8")]
    pub signed_pre_key: Option<SignedPreKeyProto>,
    #[prost(uint64, tag = "9")]
    pub signed_pre_key_rotated_at: u64,
    #[prost(uint32, tag = "10")]
    pub last_pre_key_id: u32,
    #[prost(message, repeated, tag = "11")]
    pub pre_keys: Vec<PreKeyProto>,
    #[prost(message, repeated, tag = "12")]
    pub sessions: Vec<SessionProto>,
    #[prost(message, repeated, tag = "13")]
    pub sender_keys: Vec<SenderKeyProto>,
    #[prost(message, repeated, tag = "14")]
    pub app_state_keys: Vec<AppStateKeyProto>,
    #[prost(message, repeated, tag = "15")]
    pub hash_states: Vec<HashStateProto>,
    #[prost(message, optional, tag = "16")]
    pub companion: Option<CompanionProto>,
    #[prost(message, optional, tag = "17")]
    pub config: Option<KeyStoreConfigProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SignedPreKeyProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct PreKeyProto {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(bytes = "vec", tag = "2")]
    pub private_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SessionProto {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub device_id: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub record: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SenderKeyProto {
    #[prost(string, tag = "1")]
    pub group_id: String,
    #[prost(string, tag = "2")]
    pub sender_name: String,
    #[prost(uint32, tag = "3")]
    pub sender_device_id: u32,
    #[prost(message, repeated, tag = "4")]
    pub states: Vec<SenderKeyStateProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct SenderKeyStateProto {
    #[prost(uint32, tag = "1")]
    pub key_id: u32,
    #[prost(uint32, tag = "2")]
    pub iteration: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub chain_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub signing_public_key: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct AppStateKeyProto {
    #[prost(bytes = "vec", tag = "1")]
    pub key_id: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub key_data: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub timestamp: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct HashStateProto {
    #[prost(string, tag = "1")]
    pub category: String,
    #[prost(uint64, tag = "2")]
    pub version: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub hash: Vec<u8>,
    #[prost(message, repeated, tag = "4")]
    pub entries: Vec<IndexValueProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct IndexValueProto {
    #[prost(string, tag = "1")]
    pub index_mac: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value_mac: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct CompanionProto {
    #[prost(bytes = "vec", tag = "1")]
    pub details: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub account_signature_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub account_signature: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub device_signature: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct KeyStoreConfigProto {
    #[prost(uint32, tag = "1")]
    pub pre_key_batch: u32,
    #[prost(uint64, tag = "2")]
    pub signed_pre_key_rotation_interval_secs: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct StoreProto {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(string, tag = "2")]
    pub uuid: String,
    #[prost(uint64, optional, tag = "3")]
    pub phone_number: Option<u64>,
    #[prost(string, repeated, tag = "4")]
    pub alias: Vec<String>,
    #[prost(int32, tag = "5")]
    pub client_type: i32,
    #[prost(message, optional, tag = "6")]
    pub profile: Option<ProfileProto>,
    #[prost(message, repeated, tag = "7")]
    pub contacts: Vec<ContactProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ProfileProto {
    #[prost(string, optional, tag = "1")]
    pub push_name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub locale: Option<String>,
    #[prost(bool, tag = "3")]
    pub unarchive_chats: bool,
    #[prost(bool, tag = "4")]
    pub twenty_four_hour_format: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ContactProto {
    #[prost(string, tag = "1")]
    pub jid: String,
    #[prost(string, optional, tag = "2")]
    pub full_name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub short_name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ChatProto {
    #[prost(string, tag = "1")]
    pub jid: String,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(bool, tag = "3")]
    pub muted: bool,
    #[prost(int64, tag = "4")]
    pub mute_end_timestamp: i64,
    #[prost(bool, tag = "5")]
    pub archived: bool,
    #[prost(int64, tag = "6")]
    pub pinned_timestamp: i64,
    #[prost(int32, tag = "7")]
    pub unread_count: i32,
    #[prost(message, repeated, tag = "8")]
    pub messages: Vec<MessageProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct NewsletterProto {
    #[prost(string, tag = "1")]
    pub jid: String,
    #[prost(string, optional, tag = "2")]
    pub name: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub description: Option<String>,
    #[prost(message, repeated, tag = "4")]
    pub messages: Vec<MessageProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct MessageProto {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, optional, tag = "2")]
    pub sender: Option<String>,
    #[prost(bool, tag = "3")]
    pub from_me: bool,
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
    #[prost(bool, tag = "5")]
    pub starred: bool,
    #[prost(string, optional, tag = "6")]
    pub text: Option<String>,
    #[prost(message, optional, tag = "7")]
    pub context: Option<ContextProto>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct ContextProto {
    #[prost(string, tag = "1")]
    pub quoted_message_id: String,
    #[prost(string, optional, tag = "2")]
    pub quoted_chat: Option<String>,
    #[prost(string, optional, tag = "3")]
    pub quoted_sender: Option<String>,
}
