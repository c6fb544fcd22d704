use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::db::{open_store, DataLayout, ProfileMetaStore, StoreConfig};

/// Default configuration for a freshly initialised data directory.
pub fn default_config_for(layout: &DataLayout) -> Config {
    let mut config = Config::default();
    config.store = StoreConfig::sqlite(layout.db_path_relative_string());
    config.debug_info.directory = layout.debuginfo_dir_relative_string().into();
    config
}

/// Load the YAML config from disk for a given layout, with paths resolved against its root.
pub fn load_config(layout: &DataLayout) -> Result<Config> {
    let config = Config::from_path(&layout.config_path).with_context(|| {
        format!("Failed to load config at {}", layout.config_path.display())
    })?;
    Ok(config.resolve_paths(&layout.root))
}

/// Load the config and open the metastore it names.
pub fn open_layout_store(layout: &DataLayout) -> Result<(Config, Arc<dyn ProfileMetaStore>)> {
    let config = load_config(layout)?;
    let store = open_store(&config.store)
        .with_context(|| format!("Failed to open metastore ({:?})", config.store))?;
    Ok((config, store))
}
