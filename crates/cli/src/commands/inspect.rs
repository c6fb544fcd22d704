use anyhow::Result;
use profstore_core::db::ProfileMetaStore;
use profstore_core::model::ResolvedLocation;

use crate::commands::open_context;

/// List locations, joined with their mapping and functions.
pub fn locations_command(root: &str, unsymbolized: bool, json: bool) -> Result<()> {
    let ctx = open_context(root)?;
    let store = ctx.store.as_ref();
    let locations =
        if unsymbolized { store.get_unsymbolized_locations()? } else { store.get_locations()? };
    let resolved = locations
        .iter()
        .map(|l| store.resolve_location(l.id))
        .collect::<Result<Vec<ResolvedLocation>, _>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    if resolved.is_empty() {
        println!("No locations found.");
        return Ok(());
    }

    println!("Locations:");
    for location in &resolved {
        let mapping = location
            .mapping
            .as_ref()
            .map(|m| if m.build_id.is_empty() { m.file.clone() } else { m.build_id.clone() })
            .unwrap_or_else(|| "-".to_string());
        println!("- #{} {:#x} [{}]", location.id, location.address, mapping);
        if location.lines.is_empty() {
            println!("    (unsymbolized)");
        }
        for line in &location.lines {
            println!("    {} {}:{}", line.function.name, line.function.filename, line.line);
        }
    }
    Ok(())
}

pub fn functions_command(root: &str, json: bool) -> Result<()> {
    let ctx = open_context(root)?;
    let functions = ctx.store.get_functions()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }

    if functions.is_empty() {
        println!("No functions found.");
        return Ok(());
    }
    println!("Functions:");
    for f in &functions {
        if f.filename.is_empty() {
            println!("- #{} {}", f.id, f.name);
        } else {
            println!("- #{} {} ({})", f.id, f.name, f.filename);
        }
    }
    Ok(())
}

pub fn mappings_command(root: &str, json: bool) -> Result<()> {
    let ctx = open_context(root)?;
    let mappings = ctx.store.get_mappings()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&mappings)?);
        return Ok(());
    }

    if mappings.is_empty() {
        println!("No mappings found.");
        return Ok(());
    }
    println!("Mappings:");
    for m in &mappings {
        let build_id = if m.build_id.is_empty() { "<no build id>" } else { m.build_id.as_str() };
        println!("- #{} {} {} [{:#x}-{:#x}]", m.id, build_id, m.file, m.start, m.limit);
    }
    Ok(())
}
