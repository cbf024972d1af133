use crate::Error;
use std::fmt;
use tracing::warn;

/// Where an error surfaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    AppStateSync,
    KeysFile,
    StoreFile,
    ChatFile,
    Pairing,
    MediaConnection,
    Unknown,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AppStateSync => "app state sync",
            Self::KeysFile => "keys file",
            Self::StoreFile => "store file",
            Self::ChatFile => "chat file",
            Self::Pairing => "pairing",
            Self::MediaConnection => "media connection",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// What the session should do about an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Log and carry on.
    Discard,
    Disconnect,
    Reconnect,
    /// Drop the session and its persisted state.
    LogOut,
}

pub trait ErrorHandler: Send + Sync {
    fn classify(&self, location: Location, error: &Error) -> ErrorAction;
}

/// The stock policy.
///
/// App-state integrity failures and missing keys are discarded, since the
/// sync driver recovers through a resync. A broken keys file disconnects.
/// Identity mismatches and failed trust checks log out. Timeouts reconnect.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn classify(&self, location: Location, error: &Error) -> ErrorAction {
        let action = match (location, error) {
            (_, Error::IdentityMismatch { .. } | Error::CryptographicValidation(_)) => {
                ErrorAction::LogOut
            }
            (_, Error::Timeout(_)) => ErrorAction::Reconnect,
            (
                Location::AppStateSync,
                Error::IntegrityViolation { .. } | Error::MissingAppStateKey(_),
            ) => ErrorAction::Discard,
            (Location::KeysFile, Error::Storage(_) | Error::Serde(_)) => ErrorAction::Disconnect,
            (Location::StoreFile, Error::Storage(_)) => ErrorAction::Disconnect,
            _ => ErrorAction::Discard,
        };

        if action != ErrorAction::Discard {
            warn!(%location, %error, ?action, "Session error");
        }
        action
    }
}
