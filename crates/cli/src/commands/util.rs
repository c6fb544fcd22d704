use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use profstore_core::config::Config;
use profstore_core::db::{DataLayout, StoreContext};
use profstore_core::services::{DebugInfoResolver, FilesystemResolver, InMemoryResolver};

use crate::canonicalize_or_current;

/// Resolve `root` and open the store described by its config.
pub fn open_context(root: &str) -> Result<StoreContext> {
    let root_path = canonicalize_or_current(root)?;
    StoreContext::from_root(&root_path)
}

/// Config for `root` if one exists; defaults otherwise. Used before any command runs.
pub fn config_or_default(root: &str) -> Config {
    canonicalize_or_current(root)
        .ok()
        .map(|root| DataLayout::new(root).config_path)
        .filter(|path| path.is_file())
        .and_then(|path| Config::from_path(&path).ok())
        .unwrap_or_default()
}

/// Debug-info resolver for the CLI: a JSON symbol table when given, the
/// configured filesystem store otherwise.
pub fn build_resolver(
    config: &Config,
    symbols: Option<&Path>,
) -> Result<Arc<dyn DebugInfoResolver>> {
    match symbols {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read symbol table {}", path.display()))?;
            let resolver = InMemoryResolver::from_json(&json)
                .with_context(|| format!("Failed to parse symbol table {}", path.display()))?;
            Ok(Arc::new(resolver))
        }
        None => Ok(Arc::new(FilesystemResolver::new(&config.debug_info.directory))),
    }
}

/// Helper to print whether a directory exists.
pub fn print_dir_status(label: &str, path: &Path) {
    let exists = path.is_dir();
    println!("- {label}: {} ({})", if exists { "OK" } else { "MISSING" }, path.display());
}
