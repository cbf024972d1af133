//! Protobuf messages exchanged with the server during app-state sync.

use crate::Error;

/// Whether a mutation sets or removes the value stored at its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MutationOperation {
    Set,
    Remove,
}

impl MutationOperation {
    pub(crate) fn to_wire(self) -> i32 {
        match self {
            Self::Set => 0,
            Self::Remove => 1,
        }
    }

    pub(crate) fn from_wire(value: i32) -> Result<Self, Error> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Remove),
            other => Err(Error::Serde(format!("Unknown mutation operation: {other}"))),
        }
    }

    /// Leading byte of the value MAC input.
    pub(crate) fn mac_byte(self) -> u8 {
        match self {
            Self::Set => 0x01,
            Self::Remove => 0x02,
        }
    }
}

/// An index MAC together with its encrypted value.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Record {
    #[prost(bytes = "vec", tag = "1")]
    pub index_mac: Vec<u8>,
    /// Encrypted action data followed by its 32-byte value MAC.
    #[prost(bytes = "vec", tag = "2")]
    pub value_blob: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub key_id: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Mutation {
    #[prost(int32, tag = "1")]
    pub operation: i32,
    #[prost(message, optional, tag = "2")]
    pub record: Option<Record>,
}

/// A server-ordered batch of mutations that advances a category by one
/// version.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Patch {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(message, repeated, tag = "2")]
    pub mutations: Vec<Mutation>,
    #[prost(bytes = "vec", tag = "3")]
    pub snapshot_mac: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub patch_mac: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub key_id: Vec<u8>,
}

/// Full state of a category at one version.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Snapshot {
    #[prost(uint64, tag = "1")]
    pub version: u64,
    #[prost(message, repeated, tag = "2")]
    pub records: Vec<Record>,
    #[prost(bytes = "vec", tag = "3")]
    pub mac: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub key_id: Vec<u8>,
}

/// Plaintext of an encrypted mutation value.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncActionData {
    /// JSON array addressing the target of the action.
    #[prost(bytes = "vec", tag = "1")]
    pub index: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub value: Option<SyncActionValue>,
    #[prost(bytes = "vec", tag = "3")]
    pub padding: Vec<u8>,
    #[prost(int32, tag = "4")]
    pub version: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SyncActionValue {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "2")]
    pub mute: Option<MuteAction>,
    #[prost(message, optional, tag = "3")]
    pub pin: Option<PinAction>,
    #[prost(message, optional, tag = "4")]
    pub archive: Option<ArchiveChatAction>,
    #[prost(message, optional, tag = "5")]
    pub star: Option<StarAction>,
    #[prost(message, optional, tag = "6")]
    pub mark_read: Option<MarkChatAsReadAction>,
    #[prost(message, optional, tag = "7")]
    pub delete_chat: Option<DeleteChatAction>,
    #[prost(message, optional, tag = "8")]
    pub delete_message: Option<DeleteMessageForMeAction>,
    #[prost(message, optional, tag = "9")]
    pub clear_chat: Option<ClearChatAction>,
    #[prost(message, optional, tag = "10")]
    pub contact: Option<ContactAction>,
    #[prost(message, optional, tag = "11")]
    pub push_name: Option<PushNameSetting>,
    #[prost(message, optional, tag = "12")]
    pub locale: Option<LocaleSetting>,
    #[prost(message, optional, tag = "13")]
    pub unarchive_chats: Option<UnarchiveChatsSetting>,
    #[prost(message, optional, tag = "14")]
    pub time_format: Option<TimeFormatAction>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MuteAction {
    #[prost(bool, tag = "1")]
    pub muted: bool,
    #[prost(int64, tag = "2")]
    pub mute_end_timestamp: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PinAction {
    #[prost(bool, tag = "1")]
    pub pinned: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ArchiveChatAction {
    #[prost(bool, tag = "1")]
    pub archived: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StarAction {
    #[prost(bool, tag = "1")]
    pub starred: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MarkChatAsReadAction {
    #[prost(bool, tag = "1")]
    pub read: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteChatAction {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteMessageForMeAction {
    #[prost(bool, tag = "1")]
    pub delete_media: bool,
    #[prost(int64, tag = "2")]
    pub message_timestamp: i64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClearChatAction {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ContactAction {
    #[prost(string, optional, tag = "1")]
    pub full_name: Option<String>,
    #[prost(string, optional, tag = "2")]
    pub first_name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PushNameSetting {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LocaleSetting {
    #[prost(string, tag = "1")]
    pub locale: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct UnarchiveChatsSetting {
    #[prost(bool, tag = "1")]
    pub unarchive_chats: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct TimeFormatAction {
    #[prost(bool, tag = "1")]
    pub twenty_four_hour: bool,
}
