mod error;
pub use error::Error;

mod config;
pub use config::*;

mod key_pair;
pub(crate) use key_pair::random_bytes;
pub use key_pair::KeyPair;

mod identity_key;
pub use identity_key::*;

mod pre_key;
pub use pre_key::*;

mod jid;
pub use jid::*;

mod identity;
pub use identity::*;

mod session;
pub use session::*;

mod key_store;
pub(crate) use key_store::ensure_paired;
pub use key_store::{CompanionIdentity, KeyStore};

mod app_state;
pub use app_state::*;

mod gate;
pub use gate::ReadyGate;

mod store;
pub use store::*;

mod error_handler;
pub use error_handler::*;

mod persistence;
pub use persistence::*;

mod proto;
