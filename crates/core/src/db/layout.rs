use std::path::{Path, PathBuf};

/// Logical layout of a profstore data directory on disk.
///
/// This is derived from a chosen root path. It does *not* perform any IO itself.
/// The CLI or other frontends are responsible for actually creating directories
/// and files based on this layout.
#[derive(Debug, Clone)]
pub struct DataLayout {
    /// Root directory.
    pub root: PathBuf,
    /// Directory for internal metadata (.profstore).
    pub meta_dir: PathBuf,
    /// Path to the YAML config file.
    pub config_path: PathBuf,
    /// Path to the SQLite metastore.
    pub db_path: PathBuf,
    /// Canonical samples handed to the storage engine, one JSON document per line.
    pub samples_path: PathBuf,
    /// Filesystem debug-info store (`<build_id>/debuginfo`).
    pub debuginfo_dir: PathBuf,
}

impl DataLayout {
    /// Compute the default layout for a data directory rooted at `root`.
    ///
    /// This does *not* touch the filesystem.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join(".profstore");
        let config_path = meta_dir.join("config.yml");
        let db_path = meta_dir.join("metastore.db");
        let samples_path = meta_dir.join("samples.jsonl");
        let debuginfo_dir = root.join("debuginfo");

        Self { root, meta_dir, config_path, db_path, samples_path, debuginfo_dir }
    }

    /// Compute a database path string suitable for storing in the config,
    /// typically as a path relative to `root`.
    pub fn db_path_relative_string(&self) -> String {
        relative_string(&self.root, &self.db_path)
    }

    pub fn debuginfo_dir_relative_string(&self) -> String {
        relative_string(&self.root, &self.debuginfo_dir)
    }

    /// Directory a debug file for `build_id` is expected in.
    pub fn debuginfo_path(&self, build_id: &str) -> PathBuf {
        self.debuginfo_dir.join(build_id).join("debuginfo")
    }
}

fn relative_string(root: &Path, path: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(rel) => rel.to_string_lossy().to_string(),
        Err(_) => path.to_string_lossy().to_string(),
    }
}
