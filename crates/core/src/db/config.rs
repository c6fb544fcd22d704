use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::{MemoryMetaStore, MetastoreResult, ProfileMetaStore, SqliteMetaStore};

/// Which metastore backend to open.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local store; contents are lost on exit.
    #[default]
    Memory,
    /// SQLite database file. Relative paths are resolved against the config's base directory.
    Sqlite { path: PathBuf },
}

impl StoreConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        StoreConfig::Sqlite { path: path.into() }
    }

    /// Resolve a relative database path against `base`.
    pub fn resolved(&self, base: &Path) -> StoreConfig {
        match self {
            StoreConfig::Memory => StoreConfig::Memory,
            StoreConfig::Sqlite { path } if path.is_relative() => {
                StoreConfig::Sqlite { path: base.join(path) }
            }
            other => other.clone(),
        }
    }
}

/// Open the configured backend behind the shared trait object.
pub fn open_store(config: &StoreConfig) -> MetastoreResult<Arc<dyn ProfileMetaStore>> {
    Ok(match config {
        StoreConfig::Memory => Arc::new(MemoryMetaStore::new()),
        StoreConfig::Sqlite { path } => Arc::new(SqliteMetaStore::open(path)?),
    })
}
