//! Canonicalization of raw profiles against the metastore.
//!
//! Entities are resolved in dependency order (mappings and functions, then
//! locations, then lines) so every reference written is already valid.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::db::{MetastoreError, ProfileMetaStore};
use crate::model::{FunctionId, Line, LocationId, MappingId, NewLocation};
use crate::profile::{ProfileError, ProfileGraph};
use crate::services::sink::{CanonicalSample, CanonicalSeries, LabelSet, SampleSink, SinkError};
use crate::services::symbolizer::SymbolizeTrigger;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Parse(#[from] ProfileError),
    #[error(transparent)]
    Store(#[from] MetastoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("ingestion cancelled")]
    Cancelled,
}

/// What resolving one profile did to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveStats {
    pub mappings_created: usize,
    pub functions_created: usize,
    pub locations_created: usize,
    /// Locations whose lines came with the profile.
    pub presymbolized: usize,
    /// Newly created locations left for the background symbolizer.
    pub pending_symbolization: usize,
}

/// A profile graph rewritten onto canonical ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CanonicalProfile {
    pub mappings: HashMap<u64, MappingId>,
    pub functions: HashMap<u64, FunctionId>,
    pub locations: HashMap<u64, LocationId>,
    pub samples: Vec<CanonicalSample>,
    pub stats: ResolveStats,
}

/// Result of a successful `ingest` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub samples: usize,
    pub locations: usize,
    #[serde(flatten)]
    pub stats: ResolveStats,
}

pub struct Ingester {
    store: Arc<dyn ProfileMetaStore>,
    sink: Arc<dyn SampleSink>,
    trigger: Option<SymbolizeTrigger>,
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester").field("trigger", &self.trigger).finish_non_exhaustive()
    }
}

impl Ingester {
    pub fn new(store: Arc<dyn ProfileMetaStore>, sink: Arc<dyn SampleSink>) -> Self {
        Self { store, sink, trigger: None }
    }

    /// Nudge `trigger` whenever ingestion leaves new work for the symbolizer.
    pub fn with_trigger(mut self, trigger: SymbolizeTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Parse `bytes`, canonicalize the graph and hand the samples to the sink.
    ///
    /// Returns once the sink accepted the series; symbolization happens later.
    pub async fn ingest(
        &self,
        labels: LabelSet,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<IngestSummary, IngestError> {
        let graph = ProfileGraph::parse(bytes)?;
        let store = Arc::clone(&self.store);
        let resolve_cancel = cancel.clone();
        let (graph, canonical) = tokio::task::spawn_blocking(move || {
            let canonical = resolve_graph(store.as_ref(), &graph, &resolve_cancel);
            (graph, canonical)
        })
        .await
        .map_err(|err| MetastoreError::Task(err.to_string()))?;
        let canonical = canonical?;

        let timestamp = profile_timestamp(graph.time_nanos);
        let summary = IngestSummary {
            labels: labels.clone(),
            timestamp,
            samples: canonical.samples.len(),
            locations: canonical.locations.len(),
            stats: canonical.stats,
        };

        let series = CanonicalSeries {
            labels,
            timestamp,
            duration_nanos: graph.duration_nanos,
            sample_types: graph.sample_types,
            samples: canonical.samples,
        };
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        self.sink.append(series).await?;

        if summary.stats.pending_symbolization > 0 {
            if let Some(trigger) = &self.trigger {
                trigger.nudge();
            }
        }

        info!(
            samples = summary.samples,
            locations = summary.locations,
            new_locations = summary.stats.locations_created,
            pending = summary.stats.pending_symbolization,
            "ingested profile"
        );
        Ok(summary)
    }

    /// Rewrite `graph` onto canonical ids, creating whatever the store lacks.
    ///
    /// Records created before a cancellation stay valid and are reused by later calls.
    pub fn resolve(
        &self,
        graph: &ProfileGraph,
        cancel: &CancellationToken,
    ) -> Result<CanonicalProfile, IngestError> {
        resolve_graph(self.store.as_ref(), graph, cancel)
    }
}

fn resolve_graph(
    store: &dyn ProfileMetaStore,
    graph: &ProfileGraph,
    cancel: &CancellationToken,
) -> Result<CanonicalProfile, IngestError> {
    let check = || if cancel.is_cancelled() { Err(IngestError::Cancelled) } else { Ok(()) };
    let mut out = CanonicalProfile::default();
    let mut symbolizable = HashMap::new();

    for pm in &graph.mappings {
        check()?;
        let outcome = store.create_mapping(&pm.mapping)?;
        if outcome.created {
            out.stats.mappings_created += 1;
            if pm.mapping.build_id.is_empty() {
                warn!(
                    mapping_id = %outcome.id,
                    file = %pm.mapping.file,
                    "mapping has no build id; its locations will never be symbolized"
                );
            }
        }
        out.mappings.insert(pm.id, outcome.id);
        symbolizable.insert(pm.id, !pm.mapping.build_id.is_empty());
    }

    for pf in &graph.functions {
        check()?;
        let outcome = store.create_function(&pf.function)?;
        if outcome.created {
            out.stats.functions_created += 1;
        }
        out.functions.insert(pf.id, outcome.id);
    }

    for pl in &graph.locations {
        check()?;
        let mapping_id = pl
            .mapping_id
            .map(|local| {
                out.mappings.get(&local).copied().ok_or_else(|| {
                    dangling(format!("location {} references unknown mapping {local}", pl.id))
                })
            })
            .transpose()?;
        let lines = pl
            .lines
            .iter()
            .map(|line| {
                let function_id = out.functions.get(&line.function_id).copied().ok_or_else(
                    || {
                        dangling(format!(
                            "location {} references unknown function {}",
                            pl.id, line.function_id
                        ))
                    },
                )?;
                Ok(Line::new(function_id, line.line))
            })
            .collect::<Result<Vec<_>, IngestError>>()?;

        let location =
            NewLocation { mapping_id, address: pl.address, is_folded: pl.is_folded, lines };
        let outcome = store.create_location(&location)?;
        if outcome.created {
            out.stats.locations_created += 1;
        }

        if location.is_addressable() {
            if !location.lines.is_empty() {
                match store.set_lines(outcome.id, &location.lines) {
                    Ok(()) => out.stats.presymbolized += 1,
                    Err(MetastoreError::AlreadySymbolized(_)) => {}
                    Err(err) => return Err(err.into()),
                }
            } else if outcome.created
                && pl.mapping_id.and_then(|m| symbolizable.get(&m).copied()).unwrap_or(false)
            {
                out.stats.pending_symbolization += 1;
            }
        }
        out.locations.insert(pl.id, outcome.id);
    }

    for (idx, sample) in graph.samples.iter().enumerate() {
        let stack = sample
            .location_ids
            .iter()
            .map(|id| {
                out.locations.get(id).copied().ok_or_else(|| {
                    dangling(format!("sample {idx} references unknown location {id}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        out.samples.push(CanonicalSample {
            stack,
            values: sample.values.clone(),
            labels: sample.labels.clone(),
        });
    }

    debug!(
        mappings = out.mappings.len(),
        functions = out.functions.len(),
        locations = out.locations.len(),
        "resolved profile graph"
    );
    Ok(out)
}

fn dangling(msg: String) -> IngestError {
    IngestError::Parse(ProfileError::Invalid(msg))
}

fn profile_timestamp(time_nanos: i64) -> DateTime<Utc> {
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    if time_nanos <= 0 {
        return Utc::now();
    }
    DateTime::<Utc>::from_timestamp(
        time_nanos.div_euclid(NANOS_PER_SEC),
        time_nanos.rem_euclid(NANOS_PER_SEC) as u32,
    )
    .unwrap_or_else(Utc::now)
}
