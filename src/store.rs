use crate::{Action, Identity, Jid, MessageIndex, ReadyGate, Setting, SyncAction};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Contact {
    pub jid: Jid,
    pub full_name: Option<String>,
    pub short_name: Option<String>,
}

impl Contact {
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            full_name: None,
            short_name: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChatMute {
    #[default]
    NotMuted,
    Forever,
    Until(i64),
}

impl ChatMute {
    /// A non-positive end timestamp on a muted chat means it never expires.
    pub fn from_action(muted: bool, end_timestamp: i64) -> Self {
        match (muted, end_timestamp) {
            (false, _) => Self::NotMuted,
            (true, end) if end <= 0 => Self::Forever,
            (true, end) => Self::Until(end),
        }
    }

    pub fn is_muted(self, now: i64) -> bool {
        match self {
            Self::NotMuted => false,
            Self::Forever => true,
            Self::Until(end) => now < end,
        }
    }

    pub(crate) fn end_timestamp(self) -> i64 {
        match self {
            Self::NotMuted => 0,
            Self::Forever => -1,
            Self::Until(end) => end,
        }
    }
}

/// Reference from a message to the message it quotes.
///
/// The names are derived from the rest of the store once every chat has been
/// loaded and are not persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContextInfo {
    pub quoted_message_id: String,
    pub quoted_chat: Option<Jid>,
    pub quoted_sender: Option<Jid>,
    pub quoted_chat_name: Option<String>,
    pub quoted_sender_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageInfo {
    pub id: String,
    pub sender: Option<Jid>,
    pub from_me: bool,
    pub timestamp: i64,
    pub starred: bool,
    pub text: Option<String>,
    pub context: Option<ContextInfo>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chat {
    pub jid: Jid,
    pub name: Option<String>,
    pub mute: ChatMute,
    pub archived: bool,
    /// Timestamp the chat was pinned at, 0 when not pinned.
    pub pinned_timestamp: i64,
    /// Number of unread messages; -1 marks a chat explicitly flagged unread.
    pub unread_count: i32,
    pub messages: Vec<MessageInfo>,
}

impl Chat {
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            ..Self::default()
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_timestamp != 0
    }

    pub fn find_message(&self, id: &str) -> Option<&MessageInfo> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Inserts or replaces a message, keeping messages ordered by timestamp.
    pub fn add_message(&mut self, message: MessageInfo) {
        self.messages.retain(|existing| existing.id != message.id);
        let position = self
            .messages
            .partition_point(|existing| existing.timestamp <= message.timestamp);
        self.messages.insert(position, message);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Newsletter {
    pub jid: Jid,
    pub name: Option<String>,
    pub description: Option<String>,
    pub messages: Vec<MessageInfo>,
}

impl Newsletter {
    pub fn new(jid: Jid) -> Self {
        Self {
            jid,
            ..Self::default()
        }
    }
}

/// Account-wide preferences kept in sync through app-state settings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Profile {
    pub push_name: Option<String>,
    pub locale: Option<String>,
    pub unarchive_chats: bool,
    pub twenty_four_hour_format: bool,
}

/// Endpoint used for media upload and download, negotiated after login.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaConnection {
    pub auth: String,
    pub ttl: u32,
    pub hosts: Vec<String>,
}

/// A change to a chat made while its file was still loading.
#[derive(Clone, Debug)]
enum PendingEdit {
    Action {
        index: MessageIndex,
        action: Action,
        timestamp: i64,
    },
    Message(MessageInfo),
}

impl PendingEdit {
    fn replay(self, jid: &Jid, slot: &mut Option<Chat>) {
        match self {
            Self::Action {
                index,
                action,
                timestamp,
            } => {
                apply_chat_action(slot, jid, &index, &action, timestamp);
            }
            Self::Message(message) => chat_or_new(slot, jid).add_message(message),
        }
    }
}

fn chat_or_new<'a>(slot: &'a mut Option<Chat>, jid: &Jid) -> &'a mut Chat {
    slot.get_or_insert_with(|| Chat::new(jid.clone()))
}

/// Applies the chat side of `action`. Returns whether anything changed.
fn apply_chat_action(
    slot: &mut Option<Chat>,
    jid: &Jid,
    index: &MessageIndex,
    action: &Action,
    timestamp: i64,
) -> bool {
    match action {
        Action::Mute {
            muted,
            end_timestamp,
        } => chat_or_new(slot, jid).mute = ChatMute::from_action(*muted, *end_timestamp),
        Action::Archive { archived } => chat_or_new(slot, jid).archived = *archived,
        Action::Pin { pinned } => {
            chat_or_new(slot, jid).pinned_timestamp = if *pinned { timestamp } else { 0 }
        }
        Action::MarkRead { read } => chat_or_new(slot, jid).unread_count = if *read { 0 } else { -1 },
        Action::DeleteChat => return slot.take().is_some(),
        Action::Star { starred } => {
            let (Some(chat), Some(id)) = (slot.as_mut(), index.message_id()) else {
                return false;
            };
            if let Some(message) = chat.messages.iter_mut().find(|m| m.id == id) {
                message.starred = *starred;
            }
        }
        Action::DeleteMessage { .. } => {
            let (Some(chat), Some(id)) = (slot.as_mut(), index.message_id()) else {
                return false;
            };
            chat.messages.retain(|m| m.id != id);
        }
        Action::ClearChat { keep_starred } => {
            let Some(chat) = slot.as_mut() else {
                return false;
            };
            chat.messages
                .retain(|message| *keep_starred && message.starred);
        }
        Action::Contact {
            full_name,
            first_name,
        } => {
            let Some(chat) = slot.as_mut() else {
                return false;
            };
            chat.name = first_name.clone().or_else(|| full_name.clone());
        }
    }
    true
}

/// Conversation state of one session.
///
/// Shared between the socket, the app-state engine and the persistence
/// controller for the lifetime of the session. Every mutation bumps
/// [`Store::revision`].
#[derive(Debug)]
pub struct Store {
    identity: RwLock<Identity>,
    revision: AtomicU64,
    attributed: AtomicBool,
    profile: RwLock<Profile>,
    contacts: DashMap<Jid, Contact>,
    chats: DashMap<Jid, Chat>,
    newsletters: DashMap<Jid, Newsletter>,
    /// Chat edits made before attribution finished, by chat.
    pending_edits: DashMap<Jid, Vec<PendingEdit>>,
    media_connection: ReadyGate<MediaConnection>,
}

impl Store {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity: RwLock::new(identity),
            revision: AtomicU64::new(1),
            attributed: AtomicBool::new(true),
            profile: RwLock::new(Profile::default()),
            contacts: DashMap::new(),
            chats: DashMap::new(),
            newsletters: DashMap::new(),
            pending_edits: DashMap::new(),
            media_connection: ReadyGate::new("media connection"),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity.read().clone()
    }

    pub fn uuid(&self) -> Uuid {
        self.identity.read().uuid
    }

    pub fn set_phone_number(&self, phone_number: u64) {
        self.identity.write().phone_number = Some(phone_number);
        self.touch();
    }

    pub fn add_alias(&self, alias: impl Into<String>) {
        let alias = alias.into();
        let mut identity = self.identity.write();
        if !identity.alias.contains(&alias) {
            identity.alias.push(alias);
            drop(identity);
            self.touch();
        }
    }

    /// Counter bumped by every mutation, read by change detection.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    fn touch(&self) {
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Whether every chat and newsletter file has been loaded.
    ///
    /// A freshly created store is complete; one read back from disk is not
    /// until attribution finishes.
    pub fn is_attributed(&self) -> bool {
        self.attributed.load(Ordering::Acquire)
    }

    pub(crate) fn set_attributed(&self, attributed: bool) {
        self.attributed.store(attributed, Ordering::Release);
        if attributed {
            self.pending_edits.clear();
        }
    }

    pub fn profile(&self) -> Profile {
        self.profile.read().clone()
    }

    pub(crate) fn set_profile(&self, profile: Profile) {
        *self.profile.write() = profile;
        self.touch();
    }

    pub fn apply_setting(&self, setting: &Setting) {
        {
            let mut profile = self.profile.write();
            match setting {
                Setting::PushName(name) => profile.push_name = Some(name.clone()),
                Setting::Locale(locale) => profile.locale = Some(locale.clone()),
                Setting::UnarchiveChats(value) => profile.unarchive_chats = *value,
                Setting::TimeFormat { twenty_four_hour } => {
                    profile.twenty_four_hour_format = *twenty_four_hour
                }
            }
        }
        self.touch();
    }

    pub fn find_contact(&self, jid: &Jid) -> Option<Contact> {
        self.contacts.get(jid).map(|contact| contact.clone())
    }

    pub fn add_contact(&self, contact: Contact) {
        self.contacts.insert(contact.jid.clone(), contact);
        self.touch();
    }

    pub fn contacts(&self) -> Vec<Contact> {
        self.contacts.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn find_chat(&self, jid: &Jid) -> Option<Chat> {
        self.chats.get(jid).map(|chat| chat.clone())
    }

    pub fn add_chat(&self, chat: Chat) {
        self.chats.insert(chat.jid.clone(), chat);
        self.touch();
    }

    pub fn remove_chat(&self, jid: &Jid) -> Option<Chat> {
        let removed = self.chats.remove(jid).map(|(_, chat)| chat);
        if removed.is_some() {
            self.touch();
        }
        removed
    }

    /// Merges a chat read back from disk with what happened to it in memory
    /// while it was loading.
    ///
    /// Recorded actions and messages are replayed onto the disk copy. Without
    /// recorded edits, fields of a chat created in memory win and the disk
    /// history is kept. Only a merge counts as a change.
    pub(crate) fn restore_chat(&self, chat: Chat) {
        let jid = chat.jid.clone();
        let edits = self
            .pending_edits
            .remove(&jid)
            .map(|(_, edits)| edits)
            .unwrap_or_default();

        let merged = self.edit_chat(&jid, |slot| {
            let in_memory = slot.take();
            let changed = in_memory.is_some() || !edits.is_empty();
            let mut restored = Some(chat);

            if edits.is_empty() {
                if let (Some(current), Some(base)) = (in_memory, restored.as_mut()) {
                    let history = mem::take(&mut base.messages);
                    *base = current;
                    for message in history {
                        if base.find_message(&message.id).is_none() {
                            base.add_message(message);
                        }
                    }
                }
            } else {
                for edit in edits {
                    edit.replay(&jid, &mut restored);
                }
            }

            *slot = restored;
            changed
        });
        if merged {
            self.touch();
        }
    }

    pub fn chats(&self) -> Vec<Chat> {
        self.chats.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn chat_count(&self) -> usize {
        self.chats.len()
    }

    /// Runs `update` on an existing chat. Returns `false` if the chat is
    /// unknown.
    pub fn update_chat(&self, jid: &Jid, update: impl FnOnce(&mut Chat)) -> bool {
        let updated = match self.chats.get_mut(jid) {
            Some(mut chat) => {
                update(&mut chat);
                true
            }
            None => false,
        };
        if updated {
            self.touch();
        }
        updated
    }

    /// Runs `update` on the chat for `jid`, creating it first if needed.
    pub fn update_or_create_chat(&self, jid: &Jid, update: impl FnOnce(&mut Chat)) {
        {
            let mut chat = self
                .chats
                .entry(jid.clone())
                .or_insert_with(|| Chat::new(jid.clone()));
            update(&mut chat);
        }
        self.touch();
    }

    pub fn add_message(&self, chat: &Jid, message: MessageInfo) {
        self.record_edit(chat, PendingEdit::Message(message.clone()));
        self.update_or_create_chat(chat, |chat| chat.add_message(message));
    }

    pub fn find_message(&self, chat: &Jid, id: &str) -> Option<MessageInfo> {
        self.chats
            .get(chat)
            .and_then(|chat| chat.find_message(id).cloned())
    }

    pub fn find_newsletter(&self, jid: &Jid) -> Option<Newsletter> {
        self.newsletters.get(jid).map(|newsletter| newsletter.clone())
    }

    pub fn add_newsletter(&self, newsletter: Newsletter) {
        self.newsletters.insert(newsletter.jid.clone(), newsletter);
        self.touch();
    }

    pub(crate) fn restore_newsletter(&self, newsletter: Newsletter) {
        self.newsletters
            .entry(newsletter.jid.clone())
            .or_insert(newsletter);
    }

    pub fn newsletters(&self) -> Vec<Newsletter> {
        self.newsletters
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn media_connection(&self) -> &ReadyGate<MediaConnection> {
        &self.media_connection
    }

    /// Applies a resolved app-state action.
    ///
    /// Chat-level flags create the chat when it is not known yet so that a
    /// patch arriving before the chat history is not lost. Deletions only
    /// touch what exists. While the store is being attributed the action is
    /// also recorded, to be replayed onto the chat's file once it loads.
    pub fn apply_sync_action(&self, index: &MessageIndex, action: &SyncAction, timestamp: i64) {
        let action = match action {
            SyncAction::Setting(setting) => {
                self.apply_setting(setting);
                return;
            }
            SyncAction::Action(action) => action,
        };

        let Some(jid) = index.chat() else {
            debug!(index = ?index.parts(), "Ignoring action without a chat");
            return;
        };

        if let Action::Contact {
            full_name,
            first_name,
        } = action
        {
            let mut contact = self.find_contact(&jid).unwrap_or_else(|| Contact::new(jid.clone()));
            contact.full_name = full_name.clone();
            contact.short_name = first_name.clone();
            self.add_contact(contact);
        }

        self.record_edit(
            &jid,
            PendingEdit::Action {
                index: index.clone(),
                action: action.clone(),
                timestamp,
            },
        );
        if self.edit_chat(&jid, |slot| apply_chat_action(slot, &jid, index, action, timestamp)) {
            self.touch();
        }
    }

    fn record_edit(&self, jid: &Jid, edit: PendingEdit) {
        if !self.is_attributed() {
            self.pending_edits.entry(jid.clone()).or_default().push(edit);
        }
    }

    /// Runs `edit` on the chat slot for `jid`; emptying the slot removes the
    /// chat. Returns what `edit` returns.
    fn edit_chat(&self, jid: &Jid, edit: impl FnOnce(&mut Option<Chat>) -> bool) -> bool {
        match self.chats.entry(jid.clone()) {
            Entry::Occupied(mut entry) => {
                let mut slot = Some(mem::take(entry.get_mut()));
                let changed = edit(&mut slot);
                match slot {
                    Some(chat) => *entry.get_mut() = chat,
                    None => {
                        entry.remove();
                    }
                }
                changed
            }
            Entry::Vacant(entry) => {
                let mut slot = None;
                let changed = edit(&mut slot);
                if let Some(chat) = slot {
                    entry.insert(chat);
                }
                changed
            }
        }
    }

    /// Resolves the display names of quoted chats and senders.
    ///
    /// Only meaningful once every chat is in memory.
    pub fn relink_contexts(&self) {
        let mut names: HashMap<Jid, String> = HashMap::new();
        for entry in self.chats.iter() {
            if let Some(name) = &entry.name {
                names.insert(entry.key().clone(), name.clone());
            }
        }
        for entry in self.contacts.iter() {
            let name = entry.full_name.clone().or_else(|| entry.short_name.clone());
            if let Some(name) = name {
                names.insert(entry.key().clone(), name);
            }
        }

        for mut chat in self.chats.iter_mut() {
            for message in chat.messages.iter_mut() {
                if let Some(context) = message.context.as_mut() {
                    context.quoted_chat_name = context
                        .quoted_chat
                        .as_ref()
                        .and_then(|jid| names.get(jid).cloned());
                    context.quoted_sender_name = context
                        .quoted_sender
                        .as_ref()
                        .and_then(|jid| names.get(&jid.to_user_jid()).cloned());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mute(end_timestamp: i64) -> SyncAction {
        SyncAction::Action(Action::Mute {
            muted: true,
            end_timestamp,
        })
    }

    fn chat_index(name: &str, jid: &Jid) -> MessageIndex {
        MessageIndex::new(vec![name.to_string(), jid.to_string()])
    }

    #[test]
    fn test_mutations_bump_revision() {
        let store = Store::new(Identity::web());
        let initial = store.revision();

        store.add_chat(Chat::new(Jid::user_jid(1)));
        assert!(store.revision() > initial);

        let after_add = store.revision();
        assert!(!store.update_chat(&Jid::user_jid(2), |chat| chat.archived = true));
        assert_eq!(store.revision(), after_add);
    }

    #[test]
    fn test_messages_stay_ordered() {
        let mut chat = Chat::new(Jid::user_jid(1));
        for (id, timestamp) in [("b", 20), ("a", 10), ("c", 30), ("b", 5)] {
            chat.add_message(MessageInfo {
                id: id.to_string(),
                timestamp,
                ..MessageInfo::default()
            });
        }

        let ids: Vec<_> = chat.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
    }

    #[test]
    fn test_mute_is_idempotent() {
        let store = Store::new(Identity::web());
        let jid = Jid::user_jid(15550001111);
        let index = chat_index("mute", &jid);

        store.apply_sync_action(&index, &mute(1_700_000_000), 1);
        let once = store.find_chat(&jid);
        store.apply_sync_action(&index, &mute(1_700_000_000), 1);

        assert_eq!(store.find_chat(&jid), once);
        assert_eq!(
            once.map(|chat| chat.mute),
            Some(ChatMute::Until(1_700_000_000))
        );
    }

    #[test]
    fn test_clear_chat_keeps_starred_when_asked() {
        let store = Store::new(Identity::web());
        let jid = Jid::user_jid(7);
        for (id, starred) in [("1", true), ("2", false)] {
            store.add_message(
                &jid,
                MessageInfo {
                    id: id.to_string(),
                    starred,
                    ..MessageInfo::default()
                },
            );
        }

        store.apply_sync_action(
            &chat_index("clearChat", &jid),
            &SyncAction::Action(Action::ClearChat { keep_starred: true }),
            1,
        );
        assert!(store.find_message(&jid, "1").is_some());
        assert!(store.find_message(&jid, "2").is_none());

        store.apply_sync_action(
            &chat_index("clearChat", &jid),
            &SyncAction::Action(Action::ClearChat {
                keep_starred: false,
            }),
            1,
        );
        assert_eq!(store.find_chat(&jid).map(|chat| chat.messages.len()), Some(0));
    }

    #[test]
    fn test_contact_action_renames_chat() {
        let store = Store::new(Identity::web());
        let jid = Jid::user_jid(9);
        store.add_chat(Chat::new(jid.clone()));

        store.apply_sync_action(
            &chat_index("contact", &jid),
            &SyncAction::Action(Action::Contact {
                full_name: Some("Ada Lovelace".to_string()),
                first_name: Some("Ada".to_string()),
            }),
            1,
        );

        assert_eq!(
            store.find_contact(&jid).and_then(|c| c.full_name),
            Some("Ada Lovelace".to_string())
        );
        assert_eq!(
            store.find_chat(&jid).and_then(|c| c.name),
            Some("Ada".to_string())
        );
    }

    #[test]
    fn test_relink_contexts() {
        let store = Store::new(Identity::web());
        let quoted_chat = Jid::group("120363000000000000");
        let sender = Jid::user_jid(42);

        store.add_chat(Chat {
            name: Some("Book club".to_string()),
            ..Chat::new(quoted_chat.clone())
        });
        store.add_contact(Contact {
            full_name: Some("Grace".to_string()),
            ..Contact::new(sender.clone())
        });
        store.add_message(
            &Jid::user_jid(1),
            MessageInfo {
                id: "reply".to_string(),
                context: Some(ContextInfo {
                    quoted_message_id: "original".to_string(),
                    quoted_chat: Some(quoted_chat),
                    quoted_sender: Some(sender.with_device(2)),
                    ..ContextInfo::default()
                }),
                ..MessageInfo::default()
            },
        );

        store.relink_contexts();

        let context = store
            .find_message(&Jid::user_jid(1), "reply")
            .and_then(|message| message.context)
            .unwrap();
        assert_eq!(context.quoted_chat_name.as_deref(), Some("Book club"));
        assert_eq!(context.quoted_sender_name.as_deref(), Some("Grace"));
    }

    fn message(id: &str, timestamp: i64) -> MessageInfo {
        MessageInfo {
            id: id.to_string(),
            timestamp,
            ..MessageInfo::default()
        }
    }

    fn saved_chat(jid: &Jid) -> Chat {
        let mut chat = Chat::new(jid.clone());
        for (id, timestamp) in [("1", 10), ("2", 20), ("3", 30)] {
            chat.add_message(message(id, timestamp));
        }
        chat
    }

    #[test]
    fn test_restore_replays_edits_onto_history() {
        let store = Store::new(Identity::web());
        store.set_attributed(false);
        let jid = Jid::user_jid(7);

        store.apply_sync_action(&chat_index("mute", &jid), &mute(99), 1);
        store.add_message(&jid, message("4", 40));
        assert_eq!(store.find_chat(&jid).map(|chat| chat.messages.len()), Some(1));

        store.restore_chat(saved_chat(&jid));
        store.set_attributed(true);

        let chat = store.find_chat(&jid).unwrap();
        assert_eq!(chat.mute, ChatMute::Until(99));
        let ids: Vec<_> = chat.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4"]);
    }

    #[test]
    fn test_chat_deleted_while_loading_stays_deleted() {
        let store = Store::new(Identity::web());
        store.set_attributed(false);
        let jid = Jid::user_jid(8);

        store.apply_sync_action(
            &chat_index("deleteChat", &jid),
            &SyncAction::Action(Action::DeleteChat),
            1,
        );
        store.restore_chat(saved_chat(&jid));

        assert!(store.find_chat(&jid).is_none());
    }

    #[test]
    fn test_restore_keeps_history_of_chat_created_in_memory() {
        let store = Store::new(Identity::web());
        store.set_attributed(false);
        let jid = Jid::user_jid(9);

        store.update_or_create_chat(&jid, |chat| chat.archived = true);
        store.restore_chat(saved_chat(&jid));

        let chat = store.find_chat(&jid).unwrap();
        assert!(chat.archived);
        assert_eq!(chat.messages.len(), 3);
    }

    #[test]
    fn test_restore_without_edits_is_not_a_change() {
        let store = Store::new(Identity::web());
        store.set_attributed(false);
        let before = store.revision();

        store.restore_chat(saved_chat(&Jid::user_jid(10)));

        assert_eq!(store.revision(), before);
        assert_eq!(store.chat_count(), 1);
    }
}
