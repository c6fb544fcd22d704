use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use profstore_core::db::ProfileMetaStore;
use profstore_core::services::{IngestSummary, Ingester, JsonlSink};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::commands::open_context;
use crate::{parse_labels, sha256_hex};

#[derive(Serialize)]
pub struct IngestReport {
    pub file: String,
    pub sha256: String,
    #[serde(flatten)]
    pub summary: IngestSummary,
}

/// Ingest one pprof file into the data directory at `root`.
pub async fn ingest_command(root: &str, file: &str, labels: &[String], json: bool) -> Result<()> {
    let labels = parse_labels(labels)?;
    let ctx = open_context(root)?;

    let path = Path::new(file);
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read profile {}", path.display()))?;
    let sha256 = sha256_hex(&bytes);

    let sink = Arc::new(JsonlSink::new(&ctx.layout.samples_path));
    let ingester = Ingester::new(ctx.store.clone(), sink);
    let summary = ingester
        .ingest(labels, &bytes, &CancellationToken::new())
        .await
        .with_context(|| format!("Failed to ingest {}", path.display()))?;
    ctx.store.close()?;

    if json {
        let report = IngestReport { file: file.to_string(), sha256, summary };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Ingested profile:");
    println!("  File: {}", path.display());
    println!("  SHA-256: {}", sha256);
    println!("  Timestamp: {}", summary.timestamp.to_rfc3339());
    println!("  Samples: {}", summary.samples);
    println!("  Locations: {} ({} new)", summary.locations, summary.stats.locations_created);
    println!("  Mappings created: {}", summary.stats.mappings_created);
    println!("  Functions created: {}", summary.stats.functions_created);
    println!("  Pre-symbolized: {}", summary.stats.presymbolized);
    println!("  Pending symbolization: {}", summary.stats.pending_symbolization);
    Ok(())
}
