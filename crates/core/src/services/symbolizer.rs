//! Background symbolization of unsymbolized locations.
//!
//! A pass groups unsymbolized locations by mapping, asks the debug-info
//! resolver once per mapping, and writes the returned inline chains back with
//! `set_lines`. Nothing here holds a store lock across a resolver call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{self, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SymbolizerConfig;
use crate::db::{MetastoreError, MetastoreResult, ProfileMetaStore};
use crate::model::{Line, Location, LocationId, Mapping, MappingId};
use crate::services::debuginfo::{
    AddressResult, DebugInfoResolver, FrameError, ResolveError, ResolvedFrame,
};
use crate::services::store_blocking;

const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Counters for one pass (or one partition of it).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassStats {
    /// Mapping partitions sent to the resolver.
    pub partitions: usize,
    /// Partitions dropped because the binary or the resolver was unavailable.
    pub skipped_partitions: usize,
    pub symbolized: usize,
    /// Addresses the resolver answered with no frames.
    pub unresolved: usize,
    /// Addresses whose debug info could not be decoded.
    pub failed_addresses: usize,
    /// Locations another writer symbolized first.
    pub already_symbolized: usize,
    /// Locations skipped because they are still backing off.
    pub deferred: usize,
}

impl PassStats {
    fn absorb(&mut self, other: PassStats) {
        self.partitions += other.partitions;
        self.skipped_partitions += other.skipped_partitions;
        self.symbolized += other.symbolized;
        self.unresolved += other.unresolved;
        self.failed_addresses += other.failed_addresses;
        self.already_symbolized += other.already_symbolized;
        self.deferred += other.deferred;
    }

    /// Whether the pass did anything worth logging.
    pub fn is_idle(&self) -> bool {
        *self == PassStats { deferred: self.deferred, ..PassStats::default() }
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    attempts: u32,
    retry_at: Instant,
}

/// Drives unsymbolized locations to symbolized.
pub struct Symbolizer {
    store: Arc<dyn ProfileMetaStore>,
    resolver: Arc<dyn DebugInfoResolver>,
    config: SymbolizerConfig,
    backoff: Mutex<HashMap<LocationId, Backoff>>,
}

impl std::fmt::Debug for Symbolizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Symbolizer").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Symbolizer {
    pub fn new(
        store: Arc<dyn ProfileMetaStore>,
        resolver: Arc<dyn DebugInfoResolver>,
        config: SymbolizerConfig,
    ) -> Self {
        Self { store, resolver, config, backoff: Mutex::new(HashMap::new()) }
    }

    pub fn config(&self) -> &SymbolizerConfig {
        &self.config
    }

    /// Number of locations currently backing off after a failed attempt.
    pub fn backing_off(&self) -> usize {
        self.backoff_table().len()
    }

    /// Run one pass over every unsymbolized location in the store.
    ///
    /// Store failures abort the pass; resolver failures only skip the
    /// affected mapping.
    pub async fn run_pass(&self, cancel: &CancellationToken) -> MetastoreResult<PassStats> {
        let locations =
            store_blocking(&self.store, |store| store.get_unsymbolized_locations()).await?;
        self.forget_settled(&locations);
        self.symbolize(locations, cancel).await
    }

    /// Symbolize a caller-supplied set of locations.
    ///
    /// Locations that are already symbolized or not addressable are ignored.
    pub async fn symbolize(
        &self,
        locations: Vec<Location>,
        cancel: &CancellationToken,
    ) -> MetastoreResult<PassStats> {
        let now = Instant::now();
        let mut stats = PassStats::default();

        let mut partitions: BTreeMap<MappingId, Vec<Location>> = BTreeMap::new();
        {
            let backoff = self.backoff_table();
            for location in locations {
                let Some(mapping_id) = location.mapping_id else { continue };
                if location.is_symbolized() || location.address == 0 {
                    continue;
                }
                if backoff.get(&location.id).is_some_and(|b| b.retry_at > now) {
                    stats.deferred += 1;
                    continue;
                }
                partitions.entry(mapping_id).or_default().push(location);
            }
        }

        // The first store failure ends the pass; partitions not yet started never run.
        let results: Vec<PassStats> =
            stream::iter(partitions.into_iter().map(Ok::<_, MetastoreError>))
                .map_ok(|(mapping_id, locations)| async move {
                    if cancel.is_cancelled() {
                        return Ok(PassStats::default());
                    }
                    self.symbolize_partition(mapping_id, locations).await
                })
                .try_buffer_unordered(self.config.concurrency.max(1))
                .try_collect()
                .await?;
        for partition in results {
            stats.absorb(partition);
        }

        if cancel.is_cancelled() {
            debug!(?stats, "symbolizer pass cancelled");
        }
        Ok(stats)
    }

    async fn symbolize_partition(
        &self,
        mapping_id: MappingId,
        locations: Vec<Location>,
    ) -> MetastoreResult<PassStats> {
        let mut stats = PassStats { partitions: 1, ..PassStats::default() };
        let mapping =
            store_blocking(&self.store, move |store| store.get_mapping(mapping_id)).await?;
        if !mapping.is_symbolizable() {
            stats.skipped_partitions = 1;
            return Ok(stats);
        }

        let mut addresses: Vec<u64> = locations.iter().map(|l| l.address).collect();
        addresses.sort_unstable();
        addresses.dedup();

        let resolved = match self.resolver.resolve(&mapping, &addresses).await {
            Ok(resolved) => resolved,
            Err(err) => {
                log_skipped_partition(&mapping, locations.len(), &err);
                stats.skipped_partitions = 1;
                return Ok(stats);
            }
        };

        let written =
            store_blocking(&self.store, move |store| write_back(store, &locations, &resolved))
                .await?;
        for (location_id, outcome) in written {
            match outcome {
                WriteBack::Symbolized => {
                    stats.symbolized += 1;
                    self.clear_backoff(location_id);
                }
                WriteBack::AlreadySymbolized => {
                    stats.already_symbolized += 1;
                    self.clear_backoff(location_id);
                }
                WriteBack::Unresolved => {
                    stats.unresolved += 1;
                    self.defer(location_id);
                }
                WriteBack::Corrupt(err) => {
                    warn!(
                        build_id = %mapping.build_id,
                        location_id = %location_id,
                        error = %err,
                        "skipping address with unreadable debug info"
                    );
                    stats.failed_addresses += 1;
                    self.defer(location_id);
                }
            }
        }

        debug!(
            build_id = %mapping.build_id,
            mapping_id = %mapping.id,
            addresses = addresses.len(),
            symbolized = stats.symbolized,
            unresolved = stats.unresolved + stats.failed_addresses,
            "symbolized mapping"
        );
        Ok(stats)
    }

    fn backoff_table(&self) -> std::sync::MutexGuard<'_, HashMap<LocationId, Backoff>> {
        // Backoff state is advisory; a poisoned table is still usable.
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn defer(&self, id: LocationId) {
        let mut table = self.backoff_table();
        let attempts = table.get(&id).map_or(1, |b| b.attempts.saturating_add(1));
        let delay = backoff_delay(&self.config, attempts);
        table.insert(id, Backoff { attempts, retry_at: Instant::now() + delay });
    }

    fn clear_backoff(&self, id: LocationId) {
        self.backoff_table().remove(&id);
    }

    /// Drop backoff entries for locations that got symbolized some other way.
    fn forget_settled(&self, unsymbolized: &[Location]) {
        let pending: HashSet<LocationId> = unsymbolized.iter().map(|l| l.id).collect();
        self.backoff_table().retain(|id, _| pending.contains(id));
    }

    /// Start the repeating background pass.
    ///
    /// Passes run every `interval` and whenever the returned handle's trigger
    /// is nudged. The task exits once `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> SymbolizerHandle {
        let (trigger, mut nudges) = SymbolizeTrigger::channel();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval.max(MIN_INTERVAL));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval = ?self.config.interval, "symbolizer started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                    Some(()) = nudges.recv() => {}
                }

                match self.run_pass(&cancel).await {
                    Ok(stats) if stats.is_idle() => {}
                    Ok(stats) => info!(
                        partitions = stats.partitions,
                        skipped = stats.skipped_partitions,
                        symbolized = stats.symbolized,
                        unresolved = stats.unresolved,
                        failed = stats.failed_addresses,
                        "symbolizer pass finished"
                    ),
                    Err(err) => warn!(error = %err, "symbolizer pass failed; retrying next run"),
                }
            }
            info!("symbolizer stopped");
        });

        SymbolizerHandle { trigger, cancel: token, task }
    }
}

enum WriteBack {
    Symbolized,
    AlreadySymbolized,
    Unresolved,
    Corrupt(FrameError),
}

/// Write resolved frames back for one partition. Runs on the blocking pool.
fn write_back(
    store: &dyn ProfileMetaStore,
    locations: &[Location],
    resolved: &HashMap<u64, AddressResult>,
) -> MetastoreResult<Vec<(LocationId, WriteBack)>> {
    locations
        .iter()
        .map(|location| {
            let outcome = match resolved.get(&location.address) {
                Some(Ok(frames)) if !frames.is_empty() => {
                    let lines = lines_for(store, frames)?;
                    match store.set_lines(location.id, &lines) {
                        Ok(()) => WriteBack::Symbolized,
                        Err(MetastoreError::AlreadySymbolized(_)) => WriteBack::AlreadySymbolized,
                        Err(err) => return Err(err),
                    }
                }
                Some(Err(err)) => WriteBack::Corrupt(err.clone()),
                _ => WriteBack::Unresolved,
            };
            Ok((location.id, outcome))
        })
        .collect()
}

/// Create (or look up) every frame's function, keeping the leaf-first order.
fn lines_for(
    store: &dyn ProfileMetaStore,
    frames: &[ResolvedFrame],
) -> MetastoreResult<Vec<Line>> {
    frames
        .iter()
        .map(|frame| {
            let function = store.create_function(&frame.function())?;
            Ok(Line::new(function.id, frame.line))
        })
        .collect()
}

fn log_skipped_partition(mapping: &Mapping, locations: usize, err: &ResolveError) {
    match err {
        ResolveError::BinaryNotAvailable { .. } => debug!(
            build_id = %mapping.build_id,
            locations,
            "debug info not uploaded yet; will retry"
        ),
        ResolveError::Unavailable(_) => warn!(
            build_id = %mapping.build_id,
            locations,
            error = %err,
            "debug info service unavailable; will retry"
        ),
    }
}

/// Delay before the `attempts`-th retry: `initial_backoff * 2^(attempts - 1)`, capped.
pub fn backoff_delay(config: &SymbolizerConfig, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1).min(31);
    config
        .initial_backoff
        .checked_mul(1u32 << exponent)
        .unwrap_or(config.max_backoff)
        .min(config.max_backoff)
}

/// Asks the background symbolizer to run a pass soon.
///
/// Nudges coalesce: at most one pending request is kept.
#[derive(Debug, Clone)]
pub struct SymbolizeTrigger {
    tx: mpsc::Sender<()>,
}

impl SymbolizeTrigger {
    /// A trigger and the receiving end it feeds.
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Never blocks. A full channel already has a pass queued; a closed one
    /// means the symbolizer has stopped.
    pub fn nudge(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Handle to a running background symbolizer.
#[derive(Debug)]
pub struct SymbolizerHandle {
    trigger: SymbolizeTrigger,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SymbolizerHandle {
    pub fn trigger(&self) -> SymbolizeTrigger {
        self.trigger.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the task and wait for the in-flight pass to wind down.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            warn!(error = %err, "symbolizer task ended abnormally");
        }
    }
}
