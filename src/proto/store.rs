use super::messages::{
    ChatProto, ContactProto, ContextProto, MessageProto, NewsletterProto, ProfileProto, StoreProto,
};
use super::{SCHEMA_VERSION, check_version};
use crate::{
    Chat, ChatMute, ClientType, Contact, ContextInfo, Error, Identity, Jid, MessageInfo,
    Newsletter, Profile, Store,
};
use prost::Message;
use uuid::Uuid;

impl Store {
    /// Serializes the store's own fields. Chats and newsletters are written
    /// to their own files.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let identity = self.identity();
        let profile = self.profile();

        let mut contacts: Vec<_> = self
            .contacts()
            .into_iter()
            .map(|contact| ContactProto {
                jid: contact.jid.to_string(),
                full_name: contact.full_name,
                short_name: contact.short_name,
            })
            .collect();
        contacts.sort_by(|a, b| a.jid.cmp(&b.jid));

        let store_proto = StoreProto {
            version: SCHEMA_VERSION,
            uuid: identity.uuid.to_string(),
            phone_number: identity.phone_number,
            alias: identity.alias,
            client_type: identity.client_type.to_proto(),
            profile: Some(ProfileProto {
                push_name: profile.push_name,
                locale: profile.locale,
                unarchive_chats: profile.unarchive_chats,
                twenty_four_hour_format: profile.twenty_four_hour_format,
            }),
            contacts,
        };

        Ok(store_proto.encode_to_vec())
    }

    /// Deserializes the store's own fields.
    ///
    /// The result is not attributed: its chats and newsletters still have to
    /// be loaded.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let store_proto = StoreProto::decode(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode store: {err:?}")))?;
        check_version(store_proto.version, "store")?;

        let identity = Identity {
            uuid: Uuid::parse_str(&store_proto.uuid)
                .map_err(|err| Error::Serde(format!("Invalid uuid: {err}")))?,
            phone_number: store_proto.phone_number,
            alias: store_proto.alias,
            client_type: ClientType::from_proto(store_proto.client_type).ok_or_else(|| {
                Error::Serde(format!("Unknown client type: {}", store_proto.client_type))
            })?,
        };

        let store = Store::new(identity);
        if let Some(profile) = store_proto.profile {
            store.set_profile(Profile {
                push_name: profile.push_name,
                locale: profile.locale,
                unarchive_chats: profile.unarchive_chats,
                twenty_four_hour_format: profile.twenty_four_hour_format,
            });
        }
        for contact in store_proto.contacts {
            store.add_contact(Contact {
                jid: contact.jid.parse()?,
                full_name: contact.full_name,
                short_name: contact.short_name,
            });
        }
        store.set_attributed(false);

        Ok(store)
    }
}

pub(crate) fn encode_chat(chat: &Chat) -> Vec<u8> {
    let (muted, mute_end_timestamp) = match chat.mute {
        ChatMute::NotMuted => (false, 0),
        mute => (true, mute.end_timestamp()),
    };

    ChatProto {
        jid: chat.jid.to_string(),
        name: chat.name.clone(),
        muted,
        mute_end_timestamp,
        archived: chat.archived,
        pinned_timestamp: chat.pinned_timestamp,
        unread_count: chat.unread_count,
        messages: chat.messages.iter().map(encode_message).collect(),
    }
    .encode_to_vec()
}

pub(crate) fn decode_chat(bytes: &[u8]) -> Result<Chat, Error> {
    let chat = ChatProto::decode(bytes)?;

    Ok(Chat {
        jid: chat.jid.parse()?,
        name: chat.name,
        mute: ChatMute::from_action(chat.muted, chat.mute_end_timestamp),
        archived: chat.archived,
        pinned_timestamp: chat.pinned_timestamp,
        unread_count: chat.unread_count,
        messages: chat
            .messages
            .into_iter()
            .map(decode_message)
            .collect::<Result<_, _>>()?,
    })
}

pub(crate) fn encode_newsletter(newsletter: &Newsletter) -> Vec<u8> {
    NewsletterProto {
        jid: newsletter.jid.to_string(),
        name: newsletter.name.clone(),
        description: newsletter.description.clone(),
        messages: newsletter.messages.iter().map(encode_message).collect(),
    }
    .encode_to_vec()
}

pub(crate) fn decode_newsletter(bytes: &[u8]) -> Result<Newsletter, Error> {
    let newsletter = NewsletterProto::decode(bytes)?;

    Ok(Newsletter {
        jid: newsletter.jid.parse()?,
        name: newsletter.name,
        description: newsletter.description,
        messages: newsletter
            .messages
            .into_iter()
            .map(decode_message)
            .collect::<Result<_, _>>()?,
    })
}

// Quoted names are derived on load and never written.
fn encode_message(message: &MessageInfo) -> MessageProto {
    MessageProto {
        id: message.id.clone(),
        sender: message.sender.as_ref().map(Jid::to_string),
        from_me: message.from_me,
        timestamp: message.timestamp,
        starred: message.starred,
        text: message.text.clone(),
        context: message.context.as_ref().map(|context| ContextProto {
            quoted_message_id: context.quoted_message_id.clone(),
            quoted_chat: context.quoted_chat.as_ref().map(Jid::to_string),
            quoted_sender: context.quoted_sender.as_ref().map(Jid::to_string),
        }),
    }
}

fn decode_message(message: MessageProto) -> Result<MessageInfo, Error> {
    let context = match message.context {
        Some(context) => Some(ContextInfo {
            quoted_message_id: context.quoted_message_id,
            quoted_chat: context.quoted_chat.map(|jid| jid.parse::<Jid>()).transpose()?,
            quoted_sender: context.quoted_sender.map(|jid| jid.parse::<Jid>()).transpose()?,
            quoted_chat_name: None,
            quoted_sender_name: None,
        }),
        None => None,
    };

    Ok(MessageInfo {
        id: message.id,
        sender: message.sender.map(|jid| jid.parse::<Jid>()).transpose()?,
        from_me: message.from_me,
        timestamp: message.timestamp,
        starred: message.starred,
        text: message.text,
        context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_round_trip() {
        let store = Store::new(Identity::mobile(15550001111).with_alias("work"));
        store.apply_setting(&crate::Setting::PushName("Ada".to_string()));
        store.add_contact(Contact {
            full_name: Some("Grace Hopper".to_string()),
            ..Contact::new(Jid::user_jid(15550002222))
        });

        let restored = Store::deserialize(&store.serialize().unwrap()).unwrap();

        assert_eq!(restored.identity(), store.identity());
        assert_eq!(restored.profile(), store.profile());
        assert_eq!(restored.contacts(), store.contacts());
        assert!(!restored.is_attributed());
        assert!(store.is_attributed());
    }

    #[test]
    fn test_chat_round_trip_drops_derived_names() {
        let chat = Chat {
            name: Some("Family".to_string()),
            mute: ChatMute::Forever,
            pinned_timestamp: 12,
            unread_count: -1,
            messages: vec![MessageInfo {
                id: "ABC".to_string(),
                sender: Some(Jid::user_jid(1).with_device(3)),
                timestamp: 100,
                starred: true,
                context: Some(ContextInfo {
                    quoted_message_id: "XYZ".to_string(),
                    quoted_chat: Some(Jid::group("1234")),
                    quoted_chat_name: Some("derived".to_string()),
                    ..ContextInfo::default()
                }),
                ..MessageInfo::default()
            }],
            ..Chat::new(Jid::group("5678"))
        };

        let restored = decode_chat(&encode_chat(&chat)).unwrap();

        assert_eq!(restored.mute, ChatMute::Forever);
        assert_eq!(restored.unread_count, -1);
        let context = restored.messages[0].context.clone().unwrap();
        assert_eq!(context.quoted_chat, Some(Jid::group("1234")));
        assert_eq!(context.quoted_chat_name, None);
        assert_eq!(restored.messages[0].sender, chat.messages[0].sender);
    }

    #[test]
    fn test_corrupt_chat_is_an_error() {
        assert!(decode_chat(&[0xff, 0xff, 0xff]).is_err());
    }
}
