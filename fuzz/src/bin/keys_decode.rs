#[macro_use]
extern crate afl;
use companion_state::{KeyStore, Store};

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = KeyStore::deserialize(data);
        let _ = Store::deserialize(data);
    });
}
