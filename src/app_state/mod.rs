mod patch_type;
pub use patch_type::*;

mod lt_hash;
pub use lt_hash::{HashChainState, LT_HASH_SIZE};

mod sync_key;
pub use sync_key::AppStateSyncKey;

mod wire;
pub use wire::*;

mod action;
pub use action::*;

mod transport;
pub use transport::*;

mod engine;
pub use engine::*;
