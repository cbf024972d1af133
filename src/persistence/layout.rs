use crate::{ClientType, Jid};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const KEYS_FILE: &str = "keys.proto";
const STORE_FILE: &str = "store.proto";
const EXTENSION: &str = ".proto";

/// Kind of a per-conversation file inside a session directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EntryKind {
    Chat,
    Newsletter,
}

impl EntryKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Chat => "chat_",
            Self::Newsletter => "newsletter_",
        }
    }
}

/// Where each piece of a session lives under the base directory:
///
/// ```text
/// <base>/<web|mobile>/<uuid>/keys.proto
/// <base>/<web|mobile>/<uuid>/store.proto
/// <base>/<web|mobile>/<uuid>/chat_<encoded jid>.proto
/// <base>/<web|mobile>/<uuid>/newsletter_<encoded jid>.proto
/// <base>/<web|mobile>/<encoded phone number or alias>
/// ```
///
/// Names are encoded with unpadded url-safe base64, so any jid or alias maps
/// to exactly one portable file name. Marker files hold the uuid of the
/// session they point to.
#[derive(Clone, Debug)]
pub(crate) struct Layout {
    base: PathBuf,
}

impl Layout {
    pub(crate) fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub(crate) fn base(&self) -> &Path {
        &self.base
    }

    pub(crate) fn root(&self, client_type: ClientType) -> PathBuf {
        self.base.join(client_type.directory_name())
    }

    pub(crate) fn session_dir(&self, client_type: ClientType, uuid: Uuid) -> PathBuf {
        self.root(client_type).join(uuid.to_string())
    }

    pub(crate) fn keys_file(&self, client_type: ClientType, uuid: Uuid) -> PathBuf {
        self.session_dir(client_type, uuid).join(KEYS_FILE)
    }

    pub(crate) fn store_file(&self, client_type: ClientType, uuid: Uuid) -> PathBuf {
        self.session_dir(client_type, uuid).join(STORE_FILE)
    }

    /// `None` for an empty handle, which has no file name.
    pub(crate) fn marker(&self, client_type: ClientType, handle: &str) -> Option<PathBuf> {
        if handle.is_empty() {
            return None;
        }
        Some(self.root(client_type).join(encode_name(handle)))
    }

    pub(crate) fn entry_file(&self, session_dir: &Path, kind: EntryKind, jid: &Jid) -> PathBuf {
        session_dir.join(format!(
            "{}{}{EXTENSION}",
            kind.prefix(),
            encode_name(&jid.to_string())
        ))
    }
}

/// Classifies a file inside a session directory, returning `None` for the
/// keys and store files and for anything foreign.
pub(crate) fn parse_entry(file_name: &str) -> Option<EntryKind> {
    let stem = file_name.strip_suffix(EXTENSION)?;
    [EntryKind::Chat, EntryKind::Newsletter]
        .into_iter()
        .find(|kind| stem.strip_prefix(kind.prefix()).is_some_and(|rest| !rest.is_empty()))
}

/// Recovers the jid a file was named after, for files whose content is lost.
pub(crate) fn entry_jid(file_name: &str, kind: EntryKind) -> Option<Jid> {
    let name = file_name
        .strip_suffix(EXTENSION)?
        .strip_prefix(kind.prefix())?;
    let bytes = URL_SAFE_NO_PAD.decode(name).ok()?;
    String::from_utf8(bytes).ok()?.parse().ok()
}

fn encode_name(value: &str) -> String {
    URL_SAFE_NO_PAD.encode(value)
}
