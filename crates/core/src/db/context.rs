use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::config::Config;
use crate::db::{open_layout_store, DataLayout, ProfileMetaStore};

/// Convenience wrapper bundling layout, config, and an open metastore.
pub struct StoreContext {
    pub layout: DataLayout,
    pub config: Config,
    pub store: Arc<dyn ProfileMetaStore>,
}

impl StoreContext {
    /// Load the config and open the metastore for a given root.
    pub fn from_root(root: impl AsRef<Path>) -> Result<Self> {
        let layout = DataLayout::new(root);
        let (config, store) = open_layout_store(&layout)?;
        Ok(Self { layout, config, store })
    }
}

impl std::fmt::Debug for StoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreContext")
            .field("layout", &self.layout)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
