use crate::{
    ArchiveChatAction, ClearChatAction, ContactAction, DeleteChatAction,
    DeleteMessageForMeAction, Error, Jid, LocaleSetting, MarkChatAsReadAction, MuteAction,
    PinAction, PushNameSetting, StarAction, SyncActionValue, TimeFormatAction,
    UnarchiveChatsSetting,
};

/// A conversation-level change synchronized between devices.
///
/// Every variant carries absolute values, so applying it twice converges to
/// the same state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    Mute { muted: bool, end_timestamp: i64 },
    Archive { archived: bool },
    Pin { pinned: bool },
    Star { starred: bool },
    MarkRead { read: bool },
    DeleteChat,
    DeleteMessage { delete_media: bool },
    ClearChat { keep_starred: bool },
    Contact {
        full_name: Option<String>,
        first_name: Option<String>,
    },
}

/// An account-wide preference synchronized between devices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Setting {
    PushName(String),
    Locale(String),
    UnarchiveChats(bool),
    TimeFormat { twenty_four_hour: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    Action(Action),
    Setting(Setting),
}

/// What an outgoing action applies to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionTarget {
    Account,
    Chat(Jid),
    Message {
        chat: Jid,
        message_id: String,
        from_me: bool,
        participant: Option<Jid>,
    },
}

/// The JSON array that addresses a mutation, e.g. `["mute","1234@s.whatsapp.net"]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageIndex(Vec<String>);

impl MessageIndex {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    pub fn chat(&self) -> Option<Jid> {
        self.0.get(1).and_then(|jid| jid.parse().ok())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.0.get(2).map(String::as_str)
    }

    pub fn from_me(&self) -> bool {
        self.0.get(3).is_some_and(|flag| flag == "1")
    }

    pub fn participant(&self) -> Option<Jid> {
        self.0
            .get(4)
            .filter(|participant| participant.as_str() != "0")
            .and_then(|participant| participant.parse().ok())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(&self.0)
            .map_err(|err| Error::Serde(format!("Failed to encode index: {err}")))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, Error> {
        let parts: Vec<String> = serde_json::from_slice(bytes)
            .map_err(|err| Error::Serde(format!("Failed to decode index: {err}")))?;
        if parts.is_empty() {
            return Err(Error::Serde("Empty mutation index".to_string()));
        }
        Ok(Self(parts))
    }
}

fn flag(value: bool) -> String {
    let flag = if value { "1" } else { "0" };
    flag.to_string()
}

impl SyncAction {
    /// Name stored as the first element of the index.
    pub fn index_name(&self) -> &'static str {
        match self {
            Self::Action(action) => match action {
                Action::Mute { .. } => "mute",
                Action::Archive { .. } => "archive",
                Action::Pin { .. } => "pin_v1",
                Action::Star { .. } => "star",
                Action::MarkRead { .. } => "markChatAsRead",
                Action::DeleteChat => "deleteChat",
                Action::DeleteMessage { .. } => "deleteMessageForMe",
                Action::ClearChat { .. } => "clearChat",
                Action::Contact { .. } => "contact",
            },
            Self::Setting(setting) => match setting {
                Setting::PushName(_) => "setting_pushName",
                Setting::Locale(_) => "setting_locale",
                Setting::UnarchiveChats(_) => "setting_unarchiveChats",
                Setting::TimeFormat { .. } => "time_format",
            },
        }
    }

    /// Builds the index addressing this action at `target`.
    pub fn index(&self, target: &ActionTarget) -> Result<MessageIndex, Error> {
        let name = self.index_name().to_string();

        let parts = match (self, target) {
            (Self::Setting(_), _) => vec![name],
            (
                Self::Action(Action::Star { .. } | Action::DeleteMessage { .. }),
                ActionTarget::Message {
                    chat,
                    message_id,
                    from_me,
                    participant,
                },
            ) => vec![
                name,
                chat.to_string(),
                message_id.clone(),
                flag(*from_me),
                participant
                    .as_ref()
                    .map_or_else(|| "0".to_string(), Jid::to_string),
            ],
            (Self::Action(Action::Star { .. } | Action::DeleteMessage { .. }), _) => {
                return Err(Error::InvalidAction(format!("{name} needs a message target")));
            }
            (Self::Action(action), ActionTarget::Chat(chat)) => {
                let mut parts = vec![name, chat.to_string()];
                match action {
                    Action::DeleteChat => parts.push(flag(true)),
                    Action::ClearChat { keep_starred } => {
                        parts.push(flag(!keep_starred));
                        parts.push(flag(false));
                    }
                    _ => {}
                }
                parts
            }
            (Self::Action(_), _) => {
                return Err(Error::InvalidAction(format!("{name} needs a chat target")));
            }
        };

        Ok(MessageIndex::new(parts))
    }

    /// Encodes this action as the value of a mutation.
    pub fn to_value(&self, timestamp: i64) -> SyncActionValue {
        let mut value = SyncActionValue {
            timestamp,
            ..SyncActionValue::default()
        };

        match self.clone() {
            Self::Action(Action::Mute {
                muted,
                end_timestamp,
            }) => {
                value.mute = Some(MuteAction {
                    muted,
                    mute_end_timestamp: end_timestamp,
                })
            }
            Self::Action(Action::Archive { archived }) => {
                value.archive = Some(ArchiveChatAction { archived })
            }
            Self::Action(Action::Pin { pinned }) => value.pin = Some(PinAction { pinned }),
            Self::Action(Action::Star { starred }) => value.star = Some(StarAction { starred }),
            Self::Action(Action::MarkRead { read }) => {
                value.mark_read = Some(MarkChatAsReadAction { read })
            }
            Self::Action(Action::DeleteChat) => value.delete_chat = Some(DeleteChatAction {}),
            Self::Action(Action::DeleteMessage { delete_media }) => {
                value.delete_message = Some(DeleteMessageForMeAction {
                    delete_media,
                    message_timestamp: timestamp,
                })
            }
            Self::Action(Action::ClearChat { .. }) => value.clear_chat = Some(ClearChatAction {}),
            Self::Action(Action::Contact {
                full_name,
                first_name,
            }) => {
                value.contact = Some(ContactAction {
                    full_name,
                    first_name,
                })
            }
            Self::Setting(Setting::PushName(name)) => {
                value.push_name = Some(PushNameSetting { name })
            }
            Self::Setting(Setting::Locale(locale)) => value.locale = Some(LocaleSetting { locale }),
            Self::Setting(Setting::UnarchiveChats(unarchive_chats)) => {
                value.unarchive_chats = Some(UnarchiveChatsSetting { unarchive_chats })
            }
            Self::Setting(Setting::TimeFormat { twenty_four_hour }) => {
                value.time_format = Some(TimeFormatAction { twenty_four_hour })
            }
        }

        value
    }

    /// Resolves a decrypted mutation into a typed action.
    ///
    /// Returns `None` for index names this client does not handle.
    pub fn resolve(index: &MessageIndex, value: &SyncActionValue) -> Option<Self> {
        let action = match index.name() {
            "mute" => value.mute.as_ref().map(|mute| Action::Mute {
                muted: mute.muted,
                end_timestamp: mute.mute_end_timestamp,
            }),
            "archive" => value.archive.as_ref().map(|archive| Action::Archive {
                archived: archive.archived,
            }),
            "pin_v1" => value.pin.as_ref().map(|pin| Action::Pin { pinned: pin.pinned }),
            "star" => value.star.as_ref().map(|star| Action::Star {
                starred: star.starred,
            }),
            "markChatAsRead" => value
                .mark_read
                .as_ref()
                .map(|mark| Action::MarkRead { read: mark.read }),
            "deleteChat" => value.delete_chat.as_ref().map(|_| Action::DeleteChat),
            "deleteMessageForMe" => value.delete_message.as_ref().map(|delete| {
                Action::DeleteMessage {
                    delete_media: delete.delete_media,
                }
            }),
            "clearChat" => value.clear_chat.as_ref().map(|_| Action::ClearChat {
                keep_starred: index.parts().get(2).is_some_and(|flag| flag == "0"),
            }),
            "contact" => value.contact.clone().map(|contact| Action::Contact {
                full_name: contact.full_name,
                first_name: contact.first_name,
            }),
            _ => None,
        };
        if let Some(action) = action {
            return Some(Self::Action(action));
        }

        let setting = match index.name() {
            "setting_pushName" => value
                .push_name
                .as_ref()
                .map(|setting| Setting::PushName(setting.name.clone())),
            "setting_locale" => value
                .locale
                .as_ref()
                .map(|setting| Setting::Locale(setting.locale.clone())),
            "setting_unarchiveChats" => value
                .unarchive_chats
                .as_ref()
                .map(|setting| Setting::UnarchiveChats(setting.unarchive_chats)),
            "time_format" => value.time_format.as_ref().map(|setting| Setting::TimeFormat {
                twenty_four_hour: setting.twenty_four_hour,
            }),
            _ => None,
        };
        setting.map(Self::Setting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> Jid {
        Jid::user_jid(15550001111)
    }

    #[test]
    fn test_chat_action_round_trip() {
        let action = SyncAction::Action(Action::Mute {
            muted: true,
            end_timestamp: 1_700_000_000,
        });
        let index = action.index(&ActionTarget::Chat(chat())).unwrap();

        assert_eq!(index.parts(), ["mute", "15550001111@s.whatsapp.net"]);
        assert_eq!(index.chat(), Some(chat()));

        let decoded = MessageIndex::from_json(&index.to_json().unwrap()).unwrap();
        let resolved = SyncAction::resolve(&decoded, &action.to_value(42));
        assert_eq!(resolved, Some(action));
    }

    #[test]
    fn test_message_action_addressing() {
        let action = SyncAction::Action(Action::Star { starred: true });
        let target = ActionTarget::Message {
            chat: chat(),
            message_id: "3EB0ABCDEF".to_string(),
            from_me: true,
            participant: None,
        };
        let index = action.index(&target).unwrap();

        assert_eq!(index.message_id(), Some("3EB0ABCDEF"));
        assert!(index.from_me());
        assert_eq!(index.participant(), None);

        assert!(matches!(
            action.index(&ActionTarget::Chat(chat())),
            Err(Error::InvalidAction(_))
        ));
    }

    #[test]
    fn test_clear_chat_flags() {
        let action = SyncAction::Action(Action::ClearChat { keep_starred: true });
        let index = action.index(&ActionTarget::Chat(chat())).unwrap();

        assert_eq!(index.parts()[2], "0");
        assert_eq!(SyncAction::resolve(&index, &action.to_value(1)), Some(action));
    }

    #[test]
    fn test_setting_ignores_target() {
        let setting = SyncAction::Setting(Setting::PushName("Ada".to_string()));
        let index = setting.index(&ActionTarget::Chat(chat())).unwrap();

        assert_eq!(index.parts(), ["setting_pushName"]);
        assert_eq!(SyncAction::resolve(&index, &setting.to_value(5)), Some(setting));
    }

    #[test]
    fn test_unknown_or_mismatched_values_do_not_resolve() {
        let index = MessageIndex::new(vec!["sentinel".to_string()]);
        assert_eq!(SyncAction::resolve(&index, &SyncActionValue::default()), None);

        let mute = MessageIndex::new(vec!["mute".to_string(), chat().to_string()]);
        assert_eq!(SyncAction::resolve(&mute, &SyncActionValue::default()), None);

        assert!(MessageIndex::from_json(b"[]").is_err());
        assert!(MessageIndex::from_json(b"not json").is_err());
    }
}
