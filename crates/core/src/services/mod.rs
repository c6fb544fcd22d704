//! Services built on top of the metastore: ingestion, the sample sink
//! boundary, debug-info resolution and the background symbolizer.

pub mod debuginfo;
pub mod ingest;
pub mod sink;
pub mod symbolizer;

use std::sync::Arc;

use crate::db::{MetastoreError, MetastoreResult, ProfileMetaStore};

pub use debuginfo::{
    AddressResult, DebugInfoResolver, FilesystemResolver, FrameError, InMemoryResolver,
    ResolveError, ResolvedFrame,
};
pub use ingest::{CanonicalProfile, IngestError, IngestSummary, Ingester, ResolveStats};
pub use sink::{
    CanonicalSample, CanonicalSeries, JsonlSink, LabelSet, MemorySink, SampleSink, SinkError,
};
pub use symbolizer::{backoff_delay, PassStats, SymbolizeTrigger, Symbolizer, SymbolizerHandle};

/// Run a synchronous store call on the blocking pool.
pub(crate) async fn store_blocking<T, F>(
    store: &Arc<dyn ProfileMetaStore>,
    f: F,
) -> MetastoreResult<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn ProfileMetaStore) -> MetastoreResult<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|err| MetastoreError::Task(err.to_string()))?
}
