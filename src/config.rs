use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct KeyStoreConfig {
    pub pre_key_batch: u32,
    pub signed_pre_key_rotation_interval: Duration,
}

impl Default for KeyStoreConfig {
    fn default() -> Self {
        Self {
            pre_key_batch: 30,
            signed_pre_key_rotation_interval: Duration::from_secs(7 * 24 * 60 * 60), // 1 week
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppStateConfig {
    /// Verify the snapshot and patch MACs declared alongside each patch.
    pub check_patch_macs: bool,
}

impl Default for AppStateConfig {
    fn default() -> Self {
        Self {
            check_patch_macs: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PersistenceConfig {
    pub base_directory: PathBuf,
}

impl PersistenceConfig {
    pub fn at(base_directory: impl Into<PathBuf>) -> Self {
        Self {
            base_directory: base_directory.into(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        Self {
            base_directory: home.join(".companion-state"),
        }
    }
}
