#[macro_use]
extern crate afl;
use companion_state::{
    AppStateConfig, AppStatePatchEngine, AppStateSyncKey, Identity, KeyStore, KeyStoreConfig,
    Patch, PatchType, Store,
};
use prost::Message;
use std::sync::Arc;

fn get_engine() -> AppStatePatchEngine {
    let identity = Identity::web();
    let keys = KeyStore::random(identity.uuid, identity.client_type, KeyStoreConfig::default())
        .expect("Setup failed");
    // Fixed key so the fuzzer can learn valid key ids.
    keys.add_app_state_keys([AppStateSyncKey::new(vec![0, 1], vec![7u8; 32], 0)]);

    AppStatePatchEngine::new(
        AppStateConfig::default(),
        Arc::new(keys),
        Arc::new(Store::new(identity)),
        Vec::new(),
    )
    .expect("Setup failed")
}

fn main() {
    let engine = get_engine();

    fuzz!(|data: &[u8]| {
        if let Ok(patch) = Patch::decode(data) {
            if engine.apply_patches(PatchType::Regular, &[patch]).is_err() {
                engine.reset_for_resync(PatchType::Regular);
            }
        }
    });
}
