use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const FLOWWATCH_DIR: &str = ".flowwatch";
pub const CONFIG_FILE: &str = ".flowwatch/config.yaml";
pub const STORE_FILE: &str = ".flowwatch/changes.db";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn flowwatch_dir(root: &Path) -> PathBuf {
    root.join(FLOWWATCH_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}
