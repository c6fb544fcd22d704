use std::fs;

use anyhow::{anyhow, Context, Result};
use profstore_core::config::Config;
use profstore_core::db::{default_config_for, load_config, open_store, DataLayout};
use serde::Serialize;

use crate::canonicalize_or_current;
use crate::commands::print_dir_status;

#[derive(Serialize)]
pub struct DataDirInfo {
    pub root: String,
    pub config_file: String,
    pub samples_file: String,
    pub config: Config,
}

/// Initialize a new data directory at `root`.
pub fn init_command(root: &str, force: bool) -> Result<()> {
    let root_path = canonicalize_or_current(root)?;
    let layout = DataLayout::new(&root_path);

    if layout.config_path.exists() && !force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite it",
            layout.config_path.display()
        ));
    }

    fs::create_dir_all(&layout.meta_dir)
        .with_context(|| format!("Failed to create meta dir: {}", layout.meta_dir.display()))?;
    fs::create_dir_all(&layout.debuginfo_dir).with_context(|| {
        format!("Failed to create debug info dir: {}", layout.debuginfo_dir.display())
    })?;

    let config = default_config_for(&layout);
    let yaml = config.to_yaml()?;
    fs::write(&layout.config_path, yaml)
        .with_context(|| format!("Failed to write config: {}", layout.config_path.display()))?;

    // Create the metastore immediately so follow-on commands can rely on it.
    let resolved = config.resolve_paths(&layout.root);
    let store = open_store(&resolved.store).with_context(|| {
        format!("Failed to initialize metastore at {}", layout.db_path.display())
    })?;
    store.close()?;

    println!("Initialized profstore data directory:");
    println!("  Root: {}", layout.root.display());
    println!("  Config: {}", layout.config_path.display());
    println!("  Metastore (relative): {}", layout.db_path_relative_string());
    println!("  Debug info dir: {}", layout.debuginfo_dir.display());

    Ok(())
}

/// Show layout and effective configuration of an existing data directory.
pub fn info_command(root: &str, json: bool) -> Result<()> {
    let root_path = canonicalize_or_current(root)?;
    let layout = DataLayout::new(&root_path);
    let config = load_config(&layout)?;

    if json {
        let info = DataDirInfo {
            root: layout.root.display().to_string(),
            config_file: layout.config_path.display().to_string(),
            samples_file: layout.samples_path.display().to_string(),
            config,
        };
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("profstore data directory");
    println!("========================");
    println!("Root: {}", layout.root.display());
    println!("Config file: {}", layout.config_path.display());
    println!("Store: {:?}", config.store);
    println!("Debug info: {}", config.debug_info.directory.display());
    println!(
        "Symbolizer: every {:?}, {} partition(s) in flight, backoff {:?}..{:?}",
        config.symbolizer.interval,
        config.symbolizer.concurrency,
        config.symbolizer.initial_backoff,
        config.symbolizer.max_backoff,
    );
    println!("Logging: {} ({:?})", config.logging.level, config.logging.format);
    println!();

    println!("Directories:");
    print_dir_status("Meta dir (.profstore)", &layout.meta_dir);
    print_dir_status("Debug info dir", &config.debug_info.directory);

    Ok(())
}
