//! Boundary to the debug-information service.
//!
//! A resolver answers "given this binary and these addresses, what are the
//! inline frame chains". Parsing object files is the resolver's business; the
//! symbolizer only consumes frames.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Mapping, NewFunction};

pub mod fs;
pub mod memory;

pub use fs::FilesystemResolver;
pub use memory::InMemoryResolver;

/// One frame of an address' inline chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFrame {
    pub function_name: String,
    #[serde(default)]
    pub system_name: String,
    pub filename: String,
    #[serde(default)]
    pub start_line: i64,
    pub line: i64,
}

impl ResolvedFrame {
    pub fn new(function_name: impl Into<String>, filename: impl Into<String>, line: i64) -> Self {
        Self {
            function_name: function_name.into(),
            system_name: String::new(),
            filename: filename.into(),
            start_line: 0,
            line,
        }
    }

    pub fn function(&self) -> NewFunction {
        NewFunction {
            name: self.function_name.clone(),
            system_name: self.system_name.clone(),
            filename: self.filename.clone(),
            start_line: self.start_line,
        }
    }
}

/// Debug info for a single address could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("debug info for address {address:#x} is corrupt: {reason}")]
pub struct FrameError {
    pub address: u64,
    pub reason: String,
}

/// Per-address outcome. `Ok(vec![])` means the binary has no symbol for the address.
pub type AddressResult = Result<Vec<ResolvedFrame>, FrameError>;

/// Whole-request failures. Both are retryable.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("debug info for build id {build_id} is not available")]
    BinaryNotAvailable { build_id: String },
    #[error("debug info service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait DebugInfoResolver: Send + Sync {
    /// Resolve `addresses` within `mapping`, innermost frame first.
    ///
    /// Addresses missing from the returned map are treated like `Ok(vec![])`.
    async fn resolve(
        &self,
        mapping: &Mapping,
        addresses: &[u64],
    ) -> Result<HashMap<u64, AddressResult>, ResolveError>;
}
