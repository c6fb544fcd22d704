//! profstore-core
//!
//! Symbol metastore and symbolization pipeline for a continuous-profiling
//! backend.
//!
//! Ingested pprof profiles are rewritten onto content-addressed mappings,
//! functions and locations (`db`), and a background task (`services::symbolizer`)
//! later attaches source lines to the locations that arrived as raw addresses.
//!
//! Frontends (the `profstore` CLI) should stay thin; all substantive logic
//! lives here so it is testable in isolation.

pub mod config;
pub mod db;
pub mod model;
pub mod profile;
pub mod services;

/// Returns the library version as encoded at compile time.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
