use thiserror::Error;

use crate::model::{
    Function, FunctionId, Line, Location, LocationId, Mapping, MappingId, NewFunction,
    NewLocation, NewMapping, Outcome, ResolvedLine, ResolvedLocation,
};

/// Minimum schema version we know how to handle.
///
/// `0` means "no schema yet" (fresh DB).
pub const MIN_SUPPORTED_SCHEMA_VERSION: i32 = 0;

/// Error type for metastore operations.
#[derive(Debug, Error)]
pub enum MetastoreError {
    /// A referenced entity does not exist. Always a caller bug; never retried.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: u64 },

    /// The location already carries lines; the stored sequence is left untouched.
    #[error("location {0} is already symbolized")]
    AlreadySymbolized(LocationId),

    /// Backend failure (I/O, locking, constraint violations we did not expect).
    #[error("store unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),

    /// The database was created with a newer schema version than we support.
    #[error(
        "Unsupported schema version {found}; supported range is {min_supported}..={max_supported}"
    )]
    UnsupportedSchemaVersion { found: i32, min_supported: i32, max_supported: i32 },

    /// `close` has been called on this store.
    #[error("store is closed")]
    Closed,

    /// A writer panicked while holding the store lock.
    #[error("store lock poisoned")]
    Poisoned,

    /// The blocking task running a store call panicked or was cancelled.
    #[error("store task failed: {0}")]
    Task(String),
}

impl MetastoreError {
    pub fn not_found_mapping(id: MappingId) -> Self {
        MetastoreError::NotFound { entity: "mapping", id: id.get() }
    }

    pub fn not_found_function(id: FunctionId) -> Self {
        MetastoreError::NotFound { entity: "function", id: id.get() }
    }

    pub fn not_found_location(id: LocationId) -> Self {
        MetastoreError::NotFound { entity: "location", id: id.get() }
    }

    /// Whether this error belongs to the `StoreUnavailable` class: the
    /// operation may succeed later without any change by the caller.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            MetastoreError::Unavailable(_) | MetastoreError::Poisoned | MetastoreError::Task(_)
        )
    }
}

/// Convenience result type for metastore operations.
pub type MetastoreResult<T> = Result<T, MetastoreError>;

/// Content-addressed store for mappings, functions, locations and lines.
///
/// Every `create_*` call is a get-or-create keyed on the entity's normalized
/// content; `set_lines` is the only way an existing location changes.
pub trait ProfileMetaStore: Send + Sync {
    /// Get or create a mapping keyed on `(build_id, file)`.
    ///
    /// When the mapping already exists, richer capability flags are merged into it.
    fn create_mapping(&self, mapping: &NewMapping) -> MetastoreResult<Outcome<MappingId>>;
    fn get_mapping(&self, id: MappingId) -> MetastoreResult<Mapping>;
    fn get_mappings(&self) -> MetastoreResult<Vec<Mapping>>;

    fn create_function(&self, function: &NewFunction) -> MetastoreResult<Outcome<FunctionId>>;
    fn get_function(&self, id: FunctionId) -> MetastoreResult<Function>;
    fn get_functions(&self) -> MetastoreResult<Vec<Function>>;

    /// Get or create a location keyed on `(mapping, address)`.
    ///
    /// Fails with `NotFound` if the referenced mapping is unknown.
    fn create_location(&self, location: &NewLocation) -> MetastoreResult<Outcome<LocationId>>;
    fn get_location(&self, id: LocationId) -> MetastoreResult<Location>;

    /// All locations ordered by id.
    fn get_locations(&self) -> MetastoreResult<Vec<Location>>;

    /// Locations with no lines whose mapping has a non-empty build ID.
    fn get_unsymbolized_locations(&self) -> MetastoreResult<Vec<Location>>;

    /// Attach the inline chain (innermost first) to an unsymbolized location.
    ///
    /// An empty `lines` slice is a no-op.
    fn set_lines(&self, id: LocationId, lines: &[Line]) -> MetastoreResult<()>;

    fn ping(&self) -> MetastoreResult<()>;
    fn close(&self) -> MetastoreResult<()>;

    /// Join a location with its mapping and functions.
    fn resolve_location(&self, id: LocationId) -> MetastoreResult<ResolvedLocation> {
        let location = self.get_location(id)?;
        let mapping = location.mapping_id.map(|m| self.get_mapping(m)).transpose()?;
        let lines = location
            .lines
            .iter()
            .map(|line| {
                Ok(ResolvedLine { function: self.get_function(line.function_id)?, line: line.line })
            })
            .collect::<MetastoreResult<Vec<_>>>()?;
        Ok(ResolvedLocation {
            id: location.id,
            address: location.address,
            is_folded: location.is_folded,
            mapping,
            lines,
        })
    }
}

/// Entity counts, for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StoreStats {
    pub mappings: usize,
    pub functions: usize,
    pub locations: usize,
    pub unsymbolized: usize,
}

impl StoreStats {
    pub fn collect(store: &dyn ProfileMetaStore) -> MetastoreResult<Self> {
        Ok(Self {
            mappings: store.get_mappings()?.len(),
            functions: store.get_functions()?.len(),
            locations: store.get_locations()?.len(),
            unsymbolized: store.get_unsymbolized_locations()?.len(),
        })
    }
}
