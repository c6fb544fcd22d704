mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    scenario_a_profile, ProfileBuilder, SCENARIO_A_ADDRESS, SCENARIO_A_BUILD_ID, SCENARIO_A_FILE,
};
use profstore_core::config::SymbolizerConfig;
use profstore_core::db::{
    MemoryMetaStore, MetastoreError, MetastoreResult, ProfileMetaStore, SqliteMetaStore,
};
use profstore_core::model::{
    Function, FunctionId, Line, Location, LocationId, Mapping, MappingId, NewFunction,
    NewLocation, NewMapping, Outcome,
};
use profstore_core::services::{
    backoff_delay, DebugInfoResolver, FilesystemResolver, InMemoryResolver, Ingester, LabelSet,
    MemorySink, ResolveError, ResolvedFrame, Symbolizer,
};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

fn no_backoff() -> SymbolizerConfig {
    SymbolizerConfig { initial_backoff: Duration::ZERO, ..SymbolizerConfig::default() }
}

async fn ingest(store: &Arc<dyn ProfileMetaStore>, bytes: Vec<u8>) {
    Ingester::new(Arc::clone(store), Arc::new(MemorySink::new()))
        .ingest(LabelSet::new(), &bytes, &CancellationToken::new())
        .await
        .expect("ingest");
}

fn scenario_a_resolver() -> Arc<InMemoryResolver> {
    let resolver = Arc::new(InMemoryResolver::new());
    resolver.insert(
        SCENARIO_A_BUILD_ID,
        SCENARIO_A_ADDRESS,
        vec![
            ResolvedFrame::new("main.main", SCENARIO_A_FILE, 10),
            ResolvedFrame::new("main.iteratePerTenant", SCENARIO_A_FILE, 23),
            ResolvedFrame::new("main.iterate", SCENARIO_A_FILE, 27),
        ],
    );
    resolver
}

#[tokio::test]
async fn symbolizes_single_go_location() {
    for store in [
        Arc::new(MemoryMetaStore::new()) as Arc<dyn ProfileMetaStore>,
        Arc::new(SqliteMetaStore::open_in_memory().expect("sqlite")) as Arc<dyn ProfileMetaStore>,
    ] {
        ingest(&store, scenario_a_profile().encode()).await;
        assert_eq!(store.get_unsymbolized_locations().expect("unsymbolized").len(), 1);

        let symbolizer = Symbolizer::new(store.clone(), scenario_a_resolver(), no_backoff());
        let stats = symbolizer.run_pass(&CancellationToken::new()).await.expect("pass");
        assert_eq!(stats.partitions, 1);
        assert_eq!(stats.symbolized, 1);

        assert!(store.get_unsymbolized_locations().expect("unsymbolized").is_empty());
        let locations = store.get_locations().expect("locations");
        assert_eq!(locations.len(), 1);

        let resolved = store.resolve_location(locations[0].id).expect("resolve");
        let frames: Vec<_> =
            resolved.lines.iter().map(|l| (l.function.name.as_str(), l.line)).collect();
        assert_eq!(
            frames,
            vec![("main.main", 10), ("main.iteratePerTenant", 23), ("main.iterate", 27)]
        );
        assert!(resolved.lines.iter().all(|l| l.function.filename == SCENARIO_A_FILE));
        assert_eq!(store.get_functions().expect("functions").len(), 3);
    }
}

#[tokio::test]
async fn larger_profile_leaves_only_unresolvable_addresses() {
    const BUILD_ID: &str = "b7c2a4d0e1f3";

    // 20 pre-symbolized locations (one function each) and 12 raw addresses.
    let mut builder =
        ProfileBuilder::new().mapping(1, BUILD_ID, "/usr/bin/server", 0x400000, 0x800000);
    for i in 1..=20u64 {
        builder = builder
            .function(i, &format!("pkg.pre{i}"), "pre.go")
            .location(i, 1, 0x1000 + i, &[(i, i as i64)]);
    }
    for i in 21..=32u64 {
        builder = builder.location(i, 1, 0x2000 + i, &[]);
    }
    let all: Vec<u64> = (1..=32).collect();
    let bytes = builder.sample(&all, 1).encode();

    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    ingest(&store, bytes).await;
    assert_eq!(store.get_locations().expect("locations").len(), 32);
    assert_eq!(store.get_unsymbolized_locations().expect("unsymbolized").len(), 12);
    assert_eq!(store.get_functions().expect("functions").len(), 20);

    let resolver = Arc::new(InMemoryResolver::new());
    for k in 0..5u64 {
        resolver.insert(
            BUILD_ID,
            0x2000 + 21 + k,
            vec![
                ResolvedFrame::new(format!("pkg.inlined{k}"), "server.go", 10),
                ResolvedFrame::new(format!("pkg.outer{k}"), "server.go", 20),
            ],
        );
    }
    for k in 5..9u64 {
        resolver.insert(
            BUILD_ID,
            0x2000 + 21 + k,
            vec![ResolvedFrame::new(format!("pkg.single{k}"), "server.go", 30)],
        );
    }
    // Of the last three: one unknown, one resolving to nothing, one corrupt.
    resolver.insert(BUILD_ID, 0x2000 + 31, Vec::new());
    resolver.insert_corrupt(BUILD_ID, 0x2000 + 32, "bad abbreviation code");

    let symbolizer = Symbolizer::new(store.clone(), resolver.clone(), no_backoff());
    let stats = symbolizer.run_pass(&CancellationToken::new()).await.expect("pass");

    assert_eq!(resolver.requests(), 1, "one batched request per mapping");
    assert_eq!(stats.symbolized, 9);
    assert_eq!(stats.unresolved, 2);
    assert_eq!(stats.failed_addresses, 1);
    assert_eq!(store.get_unsymbolized_locations().expect("unsymbolized").len(), 3);
    assert_eq!(store.get_functions().expect("functions").len(), 34);
}

#[tokio::test]
async fn missing_binary_skips_only_its_partition() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    let bytes = ProfileBuilder::new()
        .mapping(1, SCENARIO_A_BUILD_ID, "/bin/app", 0x400000, 0x464000)
        .mapping(2, "deadbeef", "/lib/libc.so.6", 0x7f0000000000, 0x7f0000200000)
        .location(1, 1, SCENARIO_A_ADDRESS, &[])
        .location(2, 2, 0x7f0000001234, &[])
        .sample(&[2, 1], 1)
        .encode();
    ingest(&store, bytes).await;

    let symbolizer = Symbolizer::new(store.clone(), scenario_a_resolver(), no_backoff());
    let stats = symbolizer.run_pass(&CancellationToken::new()).await.expect("pass");

    assert_eq!(stats.partitions, 2);
    assert_eq!(stats.skipped_partitions, 1);
    assert_eq!(stats.symbolized, 1);
    let remaining = store.get_unsymbolized_locations().expect("unsymbolized");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].address, 0x7f0000001234);
    assert_eq!(symbolizer.backing_off(), 0, "partition failures do not back off");
}

#[tokio::test]
async fn unavailable_resolver_is_retried_next_pass() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    ingest(&store, scenario_a_profile().encode()).await;

    let resolver = scenario_a_resolver();
    resolver.set_unavailable(SCENARIO_A_BUILD_ID, true);
    let symbolizer = Symbolizer::new(store.clone(), resolver.clone(), SymbolizerConfig::default());
    let cancel = CancellationToken::new();

    let first = symbolizer.run_pass(&cancel).await.expect("first pass");
    assert_eq!(first.skipped_partitions, 1);
    assert_eq!(store.get_unsymbolized_locations().expect("unsymbolized").len(), 1);

    resolver.set_unavailable(SCENARIO_A_BUILD_ID, false);
    let second = symbolizer.run_pass(&cancel).await.expect("second pass");
    assert_eq!(second.symbolized, 1);
    assert_eq!(second.deferred, 0);
    assert!(store.get_unsymbolized_locations().expect("unsymbolized").is_empty());
}

#[tokio::test]
async fn stale_locations_count_as_already_symbolized() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    ingest(&store, scenario_a_profile().encode()).await;
    let stale = store.get_unsymbolized_locations().expect("unsymbolized");

    let symbolizer = Symbolizer::new(store.clone(), scenario_a_resolver(), no_backoff());
    let cancel = CancellationToken::new();
    symbolizer.run_pass(&cancel).await.expect("pass");

    // A second worker holding the same snapshot races and loses.
    let racer = Symbolizer::new(store.clone(), scenario_a_resolver(), no_backoff());
    let stats = racer.symbolize(stale, &cancel).await.expect("racing pass");
    assert_eq!(stats.symbolized, 0);
    assert_eq!(stats.already_symbolized, 1);
    assert_eq!(store.get_functions().expect("functions").len(), 3);
}

#[tokio::test(start_paused = true)]
async fn unresolved_addresses_back_off_exponentially() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    ingest(&store, scenario_a_profile().encode()).await;

    let resolver = Arc::new(InMemoryResolver::new());
    resolver.insert_binary(SCENARIO_A_BUILD_ID);
    let config = SymbolizerConfig {
        initial_backoff: Duration::from_secs(60),
        max_backoff: Duration::from_secs(600),
        ..SymbolizerConfig::default()
    };
    let symbolizer = Symbolizer::new(store.clone(), resolver.clone(), config);
    let cancel = CancellationToken::new();

    let first = symbolizer.run_pass(&cancel).await.expect("first pass");
    assert_eq!(first.unresolved, 1);
    assert_eq!(symbolizer.backing_off(), 1);

    let second = symbolizer.run_pass(&cancel).await.expect("second pass");
    assert_eq!(second.deferred, 1);
    assert_eq!(second.partitions, 0);
    assert_eq!(resolver.requests(), 1, "deferred locations are not sent to the resolver");

    // Debug info shows up, but the location is still backing off.
    resolver.insert(
        SCENARIO_A_BUILD_ID,
        SCENARIO_A_ADDRESS,
        vec![ResolvedFrame::new("main.main", SCENARIO_A_FILE, 10)],
    );
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(symbolizer.run_pass(&cancel).await.expect("third pass").deferred, 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let fourth = symbolizer.run_pass(&cancel).await.expect("fourth pass");
    assert_eq!(fourth.symbolized, 1);
    assert_eq!(symbolizer.backing_off(), 0);
}

#[tokio::test(start_paused = true)]
async fn locations_symbolized_by_ingest_leave_the_backoff_table() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    ingest(&store, scenario_a_profile().encode()).await;

    let resolver = Arc::new(InMemoryResolver::new());
    resolver.insert_binary(SCENARIO_A_BUILD_ID);
    let config = SymbolizerConfig {
        initial_backoff: Duration::from_secs(3600),
        ..SymbolizerConfig::default()
    };
    let symbolizer = Symbolizer::new(store.clone(), resolver, config);
    let cancel = CancellationToken::new();

    symbolizer.run_pass(&cancel).await.expect("first pass");
    assert_eq!(symbolizer.backing_off(), 1);

    // A later upload carries lines for the same address.
    let presymbolized = ProfileBuilder::new()
        .mapping(1, SCENARIO_A_BUILD_ID, "/bin/pprof-labels-example", 4194304, 4603904)
        .function(1, "main.main", SCENARIO_A_FILE)
        .location(1, 1, SCENARIO_A_ADDRESS, &[(1, 10)])
        .sample(&[1], 10)
        .encode();
    ingest(&store, presymbolized).await;
    assert!(store.get_unsymbolized_locations().expect("unsymbolized").is_empty());

    let stats = symbolizer.run_pass(&cancel).await.expect("second pass");
    assert_eq!(stats, Default::default());
    assert_eq!(symbolizer.backing_off(), 0);
}

/// Delegates to a memory store but fails every `set_lines`.
struct FailingWrites {
    inner: MemoryMetaStore,
}

impl ProfileMetaStore for FailingWrites {
    fn create_mapping(&self, mapping: &NewMapping) -> MetastoreResult<Outcome<MappingId>> {
        self.inner.create_mapping(mapping)
    }
    fn get_mapping(&self, id: MappingId) -> MetastoreResult<Mapping> {
        self.inner.get_mapping(id)
    }
    fn get_mappings(&self) -> MetastoreResult<Vec<Mapping>> {
        self.inner.get_mappings()
    }
    fn create_function(&self, function: &NewFunction) -> MetastoreResult<Outcome<FunctionId>> {
        self.inner.create_function(function)
    }
    fn get_function(&self, id: FunctionId) -> MetastoreResult<Function> {
        self.inner.get_function(id)
    }
    fn get_functions(&self) -> MetastoreResult<Vec<Function>> {
        self.inner.get_functions()
    }
    fn create_location(&self, location: &NewLocation) -> MetastoreResult<Outcome<LocationId>> {
        self.inner.create_location(location)
    }
    fn get_location(&self, id: LocationId) -> MetastoreResult<Location> {
        self.inner.get_location(id)
    }
    fn get_locations(&self) -> MetastoreResult<Vec<Location>> {
        self.inner.get_locations()
    }
    fn get_unsymbolized_locations(&self) -> MetastoreResult<Vec<Location>> {
        self.inner.get_unsymbolized_locations()
    }
    fn set_lines(&self, _id: LocationId, _lines: &[Line]) -> MetastoreResult<()> {
        Err(MetastoreError::Poisoned)
    }
    fn ping(&self) -> MetastoreResult<()> {
        self.inner.ping()
    }
    fn close(&self) -> MetastoreResult<()> {
        self.inner.close()
    }
}

#[tokio::test]
async fn store_failure_aborts_the_pass() {
    let store: Arc<dyn ProfileMetaStore> =
        Arc::new(FailingWrites { inner: MemoryMetaStore::new() });
    let bytes = ProfileBuilder::new()
        .mapping(1, SCENARIO_A_BUILD_ID, "/bin/app", 0x400000, 0x464000)
        .mapping(2, "deadbeef", "/lib/libc.so.6", 0x7f0000000000, 0x7f0000200000)
        .location(1, 1, SCENARIO_A_ADDRESS, &[])
        .location(2, 2, 0x7f0000001234, &[])
        .sample(&[2, 1], 1)
        .encode();
    ingest(&store, bytes).await;

    let resolver = scenario_a_resolver();
    resolver.insert("deadbeef", 0x7f0000001234, vec![ResolvedFrame::new("memcpy", "memcpy.S", 1)]);
    let config = SymbolizerConfig { concurrency: 1, ..no_backoff() };
    let symbolizer = Symbolizer::new(store.clone(), resolver.clone(), config);

    let err = symbolizer.run_pass(&CancellationToken::new()).await.expect_err("store failure");
    assert!(err.is_unavailable());
    assert_eq!(resolver.requests(), 1, "remaining partitions are not started");
    assert_eq!(symbolizer.backing_off(), 0);
    assert_eq!(store.get_unsymbolized_locations().expect("unsymbolized").len(), 2);
}

#[test]
fn backoff_delay_doubles_up_to_the_cap() {
    let config = SymbolizerConfig {
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(100),
        ..SymbolizerConfig::default()
    };
    assert_eq!(backoff_delay(&config, 1), Duration::from_secs(30));
    assert_eq!(backoff_delay(&config, 2), Duration::from_secs(60));
    assert_eq!(backoff_delay(&config, 3), Duration::from_secs(100));
    assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(100));
}

#[tokio::test]
async fn cancelled_pass_touches_nothing() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    ingest(&store, scenario_a_profile().encode()).await;

    let resolver = scenario_a_resolver();
    let symbolizer = Symbolizer::new(store.clone(), resolver.clone(), no_backoff());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stats = symbolizer.run_pass(&cancel).await.expect("pass");
    assert_eq!(stats.partitions, 0);
    assert_eq!(resolver.requests(), 0);
    assert_eq!(store.get_unsymbolized_locations().expect("unsymbolized").len(), 1);
}

#[tokio::test]
async fn background_task_symbolizes_after_nudge() {
    let store: Arc<dyn ProfileMetaStore> = Arc::new(MemoryMetaStore::new());
    let config = SymbolizerConfig { interval: Duration::from_secs(3600), ..no_backoff() };
    let symbolizer = Arc::new(Symbolizer::new(store.clone(), scenario_a_resolver(), config));
    let handle = symbolizer.spawn(CancellationToken::new());

    // Let the immediate first tick run against the empty store.
    tokio::time::sleep(Duration::from_millis(20)).await;

    Ingester::new(store.clone(), Arc::new(MemorySink::new()))
        .with_trigger(handle.trigger())
        .ingest(LabelSet::new(), &scenario_a_profile().encode(), &CancellationToken::new())
        .await
        .expect("ingest");

    let mut remaining = usize::MAX;
    for _ in 0..200 {
        remaining = store.get_unsymbolized_locations().expect("unsymbolized").len();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(remaining, 0, "nudge should trigger a pass well before the next interval");

    handle.shutdown().await;
}

#[tokio::test]
async fn filesystem_resolver_reports_missing_and_unreadable_binaries() {
    let dir = tempdir().expect("tempdir");
    let resolver = FilesystemResolver::new(dir.path());
    let mut mapping = profstore_core::model::Mapping {
        id: profstore_core::model::MappingId(1),
        start: 0x400000,
        limit: 0x464000,
        offset: 0,
        file: "/bin/app".to_string(),
        build_id: SCENARIO_A_BUILD_ID.to_string(),
        flags: Default::default(),
    };

    match resolver.resolve(&mapping, &[SCENARIO_A_ADDRESS]).await {
        Err(ResolveError::BinaryNotAvailable { build_id }) => {
            assert_eq!(build_id, SCENARIO_A_BUILD_ID)
        }
        other => panic!("expected BinaryNotAvailable, got {other:?}"),
    }

    let path = resolver.debuginfo_path(SCENARIO_A_BUILD_ID);
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(&path, b"not an object file").expect("write");
    match resolver.resolve(&mapping, &[SCENARIO_A_ADDRESS]).await {
        Err(ResolveError::Unavailable(_)) => {}
        other => panic!("expected Unavailable, got {other:?}"),
    }

    mapping.build_id = "../escape".to_string();
    assert!(matches!(
        resolver.resolve(&mapping, &[1]).await,
        Err(ResolveError::BinaryNotAvailable { .. })
    ));
}

#[tokio::test]
async fn in_memory_resolver_loads_symbol_tables_from_json() {
    let json = r#"{
        "2d6912fd3dd64542f6f6294f4bf9cb6c265b3085": {
            "0x463781": [
                {"function_name": "main.main", "filename": "main.go", "line": 10},
                {"function_name": "main.iterate", "filename": "main.go", "line": 27}
            ],
            "4601856": []
        }
    }"#;
    let resolver = InMemoryResolver::from_json(json).expect("parse table");
    let mapping = profstore_core::model::Mapping {
        id: profstore_core::model::MappingId(1),
        start: 0,
        limit: 0,
        offset: 0,
        file: String::new(),
        build_id: SCENARIO_A_BUILD_ID.to_string(),
        flags: Default::default(),
    };

    let resolved =
        resolver.resolve(&mapping, &[SCENARIO_A_ADDRESS, 0x463800, 0x1]).await.expect("resolve");
    let frames = resolved[&SCENARIO_A_ADDRESS].as_ref().expect("frames");
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[1].function_name, "main.iterate");
    assert_eq!(resolved[&0x463800_u64].as_ref().expect("empty").len(), 0);
    assert!(!resolved.contains_key(&0x1_u64));

    assert!(InMemoryResolver::from_json(r#"{"b": {"zz": []}}"#).is_err());
}
