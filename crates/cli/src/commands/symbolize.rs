use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use profstore_core::db::ProfileMetaStore;
use profstore_core::services::Symbolizer;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::commands::{build_resolver, open_context};

/// Run a single symbolization pass and report what it did.
pub async fn symbolize_command(root: &str, symbols: Option<&Path>, json: bool) -> Result<()> {
    let ctx = open_context(root)?;
    let resolver = build_resolver(&ctx.config, symbols)?;
    let symbolizer = Symbolizer::new(ctx.store.clone(), resolver, ctx.config.symbolizer);

    let stats = symbolizer
        .run_pass(&CancellationToken::new())
        .await
        .context("Symbolization pass failed")?;
    let remaining = ctx.store.get_unsymbolized_locations()?.len();
    ctx.store.close()?;

    if json {
        let mut value = serde_json::to_value(stats)?;
        value["remaining"] = remaining.into();
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Symbolization pass:");
    println!("  Partitions: {} ({} skipped)", stats.partitions, stats.skipped_partitions);
    println!("  Symbolized: {}", stats.symbolized);
    println!("  Unresolved: {}", stats.unresolved);
    println!("  Failed addresses: {}", stats.failed_addresses);
    println!("  Already symbolized: {}", stats.already_symbolized);
    println!("  Remaining unsymbolized: {}", remaining);
    Ok(())
}

/// Run the background symbolizer until Ctrl-C.
pub async fn run_command(root: &str, symbols: Option<&Path>) -> Result<()> {
    let ctx = open_context(root)?;
    let resolver = build_resolver(&ctx.config, symbols)?;
    let symbolizer = Arc::new(Symbolizer::new(ctx.store.clone(), resolver, ctx.config.symbolizer));

    let cancel = CancellationToken::new();
    let handle = symbolizer.spawn(cancel.clone());
    println!("Symbolizer running for {} (Ctrl-C to stop)", ctx.layout.root.display());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("shutting down");
    handle.shutdown().await;
    ctx.store.close()?;
    Ok(())
}
