mod messages;

mod keys;
mod store;
pub(crate) use store::{decode_chat, decode_newsletter, encode_chat, encode_newsletter};

use crate::Error;

/// Current schema version of the keys and store files.
const SCHEMA_VERSION: u32 = 1;

fn check_version(version: u32, what: &str) -> Result<(), Error> {
    if version != SCHEMA_VERSION {
        return Err(Error::Serde(format!(
            "Unsupported {what} schema version: {version}"
        )));
    }
    Ok(())
}

/// Copies a fixed-size field, failing on a length mismatch.
fn array<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N], Error> {
    if bytes.len() != N {
        return Err(Error::Serde(format!("Invalid {what} length")));
    }
    let mut array = [0u8; N];
    array.copy_from_slice(bytes);
    Ok(array)
}
