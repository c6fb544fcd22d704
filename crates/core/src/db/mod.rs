//! Metastore: content-addressed storage for the symbol graph.
//!
//! This module defines:
//! - `ProfileMetaStore`: the typed create/read/`set_lines` capability set.
//! - `ContentTable`: the generic get-or-create primitive behind the in-memory backend.
//! - `MemoryMetaStore` and `SqliteMetaStore`: interchangeable backends.
//! - `StoreConfig` / `open_store`: backend selection.
//! - `DataLayout` and helpers to open the store of an on-disk data directory.

pub mod config;
pub mod content;
pub mod context;
pub mod layout;
pub mod memory;
pub mod metastore;
pub mod sqlite;
pub mod util;

pub use config::*;
pub use content::*;
pub use context::*;
pub use layout::*;
pub use memory::*;
pub use metastore::*;
pub use sqlite::*;
pub use util::*;
