use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub fn data_root() -> PathBuf {
    if let Some(pd) = ProjectDirs::from("com", "notedeck", "NoteDeck") {
        pd.data_dir().to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

/// Store file and backup directory under `root`.
pub fn store_file_in(root: &Path) -> (PathBuf, PathBuf) {
    (root.join("notedeck.json"), root.join("backups"))
}

pub fn default_store_file() -> (PathBuf, PathBuf) {
    store_file_in(&data_root())
}
