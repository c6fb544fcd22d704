use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde::de::Error as _;

use crate::model::Mapping;
use crate::services::debuginfo::{
    AddressResult, DebugInfoResolver, FrameError, ResolveError, ResolvedFrame,
};

#[derive(Debug, Default)]
struct Tables {
    symbols: HashMap<String, HashMap<u64, AddressResult>>,
    unavailable: HashSet<String>,
}

/// A programmable symbol table keyed by build id.
///
/// Build ids with no table at all resolve as "binary not available".
#[derive(Debug, Default)]
pub struct InMemoryResolver {
    tables: RwLock<Tables>,
    requests: AtomicUsize,
}

impl InMemoryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a symbol table from JSON: `{ "<build_id>": { "<address>": [frames...] } }`.
    ///
    /// Addresses are decimal or `0x`-prefixed hexadecimal strings.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let table: BTreeMap<String, BTreeMap<String, Vec<ResolvedFrame>>> =
            serde_json::from_str(json)?;
        let resolver = Self::new();
        for (build_id, addresses) in table {
            resolver.insert_binary(&build_id);
            for (address, frames) in addresses {
                let address = parse_address(&address).ok_or_else(|| {
                    serde_json::Error::custom(format!("invalid address {address:?} for {build_id}"))
                })?;
                resolver.insert(&build_id, address, frames);
            }
        }
        Ok(resolver)
    }

    /// Register the inline chain (innermost first) for `address` in `build_id`.
    pub fn insert(&self, build_id: &str, address: u64, frames: Vec<ResolvedFrame>) {
        let mut tables = self.write_tables();
        tables.symbols.entry(build_id.to_string()).or_default().insert(address, Ok(frames));
    }

    /// Make `address` fail with corrupt debug info.
    pub fn insert_corrupt(&self, build_id: &str, address: u64, reason: &str) {
        let mut tables = self.write_tables();
        tables
            .symbols
            .entry(build_id.to_string())
            .or_default()
            .insert(address, Err(FrameError { address, reason: reason.to_string() }));
    }

    /// Register `build_id` as known without any symbols yet.
    pub fn insert_binary(&self, build_id: &str) {
        let mut tables = self.write_tables();
        tables.symbols.entry(build_id.to_string()).or_default();
    }

    /// Make every request for `build_id` fail as if the service were down.
    pub fn set_unavailable(&self, build_id: &str, unavailable: bool) {
        let mut tables = self.write_tables();
        if unavailable {
            tables.unavailable.insert(build_id.to_string());
        } else {
            tables.unavailable.remove(build_id);
        }
    }

    // Every write is a single map operation, so a poisoned table is still consistent.
    fn write_tables(&self) -> RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_tables(&self) -> RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of `resolve` calls served so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DebugInfoResolver for InMemoryResolver {
    async fn resolve(
        &self,
        mapping: &Mapping,
        addresses: &[u64],
    ) -> Result<HashMap<u64, AddressResult>, ResolveError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let tables = self.read_tables();

        if tables.unavailable.contains(&mapping.build_id) {
            return Err(ResolveError::Unavailable(format!(
                "resolver offline for {}",
                mapping.build_id
            )));
        }
        let symbols = tables.symbols.get(&mapping.build_id).ok_or_else(|| {
            ResolveError::BinaryNotAvailable { build_id: mapping.build_id.clone() }
        })?;

        Ok(addresses
            .iter()
            .filter_map(|address| symbols.get(address).map(|r| (*address, r.clone())))
            .collect())
    }
}

fn parse_address(s: &str) -> Option<u64> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}
