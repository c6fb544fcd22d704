use std::collections::BTreeMap;

use anyhow::Result;
use profstore_core::db::{ProfileMetaStore, StoreStats};
use serde::Serialize;

use crate::commands::open_context;

#[derive(Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub stats: StoreStats,
    /// Unsymbolized locations per build id.
    pub pending_by_build_id: BTreeMap<String, usize>,
}

/// Entity counts and the symbolization backlog.
pub fn status_command(root: &str, json: bool) -> Result<()> {
    let ctx = open_context(root)?;
    let store = ctx.store.as_ref();
    let stats = StoreStats::collect(store)?;

    let build_ids: BTreeMap<_, _> =
        store.get_mappings()?.into_iter().map(|m| (m.id, m.build_id)).collect();
    let mut pending_by_build_id = BTreeMap::new();
    for location in store.get_unsymbolized_locations()? {
        if let Some(build_id) = location.mapping_id.and_then(|id| build_ids.get(&id)) {
            *pending_by_build_id.entry(build_id.clone()).or_insert(0) += 1;
        }
    }

    if json {
        let report = StatusReport { stats, pending_by_build_id };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Mappings: {}", stats.mappings);
    println!("Functions: {}", stats.functions);
    println!("Locations: {}", stats.locations);
    println!("Unsymbolized: {}", stats.unsymbolized);
    for (build_id, count) in &pending_by_build_id {
        println!("  - {build_id}: {count}");
    }
    Ok(())
}
