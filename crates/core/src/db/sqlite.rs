use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::db::metastore::MIN_SUPPORTED_SCHEMA_VERSION;
use crate::db::{MetastoreError, MetastoreResult, ProfileMetaStore};
use crate::model::{
    Function, FunctionId, Line, Location, LocationId, Mapping, MappingFlags, MappingId,
    NewFunction, NewLocation, NewMapping, Outcome,
};

/// Latest schema version this crate knows about.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// `mapping_id` column value for locations without a mapping.
///
/// SQLite treats NULLs as distinct inside UNIQUE constraints, so "no mapping"
/// is stored as zero to keep such locations deduplicated.
const NO_MAPPING: i64 = 0;

/// SQLite-backed metastore.
///
/// A thin wrapper around a mutex-guarded `rusqlite::Connection` that is responsible for:
/// - Opening/creating the DB file.
/// - Applying schema migrations.
/// - Expressing get-or-create as `INSERT .. ON CONFLICT DO NOTHING` over UNIQUE keys.
#[derive(Debug)]
pub struct SqliteMetaStore {
    conn: Mutex<Option<Connection>>,
}

impl SqliteMetaStore {
    /// Open (or create) a metastore database at the given path and ensure the schema exists.
    pub fn open(path: &Path) -> MetastoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        apply_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(Some(conn)) })
    }

    /// Open a private, non-persistent database. Used by tests and one-shot tooling.
    pub fn open_in_memory() -> MetastoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        apply_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(Some(conn)) })
    }

    /// Read the schema version of the open database.
    pub fn schema_version(&self) -> MetastoreResult<i32> {
        self.with_conn(|conn| current_schema_version(conn))
    }

    fn with_conn<R>(
        &self,
        f: impl FnOnce(&mut Connection) -> MetastoreResult<R>,
    ) -> MetastoreResult<R> {
        let mut guard = self.conn.lock().map_err(|_| MetastoreError::Poisoned)?;
        let conn = guard.as_mut().ok_or(MetastoreError::Closed)?;
        f(conn)
    }
}

impl ProfileMetaStore for SqliteMetaStore {
    fn create_mapping(&self, mapping: &NewMapping) -> MetastoreResult<Outcome<MappingId>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                r#"
                INSERT INTO mappings (build_id, file, memory_start, memory_limit, file_offset,
                                      has_functions, has_filenames, has_line_numbers,
                                      has_inline_frames)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(build_id, file) DO NOTHING
                "#,
                params![
                    mapping.build_id,
                    mapping.file,
                    mapping.start as i64,
                    mapping.limit as i64,
                    mapping.offset as i64,
                    mapping.flags.has_functions,
                    mapping.flags.has_filenames,
                    mapping.flags.has_line_numbers,
                    mapping.flags.has_inline_frames,
                ],
            )? == 1;

            let id: i64 = tx.query_row(
                "SELECT id FROM mappings WHERE build_id = ?1 AND file = ?2",
                params![mapping.build_id, mapping.file],
                |row| row.get(0),
            )?;

            if !inserted {
                tx.execute(
                    r#"
                    UPDATE mappings
                    SET has_functions = has_functions OR ?2,
                        has_filenames = has_filenames OR ?3,
                        has_line_numbers = has_line_numbers OR ?4,
                        has_inline_frames = has_inline_frames OR ?5
                    WHERE id = ?1
                    "#,
                    params![
                        id,
                        mapping.flags.has_functions,
                        mapping.flags.has_filenames,
                        mapping.flags.has_line_numbers,
                        mapping.flags.has_inline_frames,
                    ],
                )?;
            }

            tx.commit()?;
            Ok(Outcome::new(MappingId(id as u64), inserted))
        })
    }

    fn get_mapping(&self, id: MappingId) -> MetastoreResult<Mapping> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM mappings WHERE id = ?1"),
                params![id.get() as i64],
                map_mapping,
            )
            .optional()?
            .ok_or_else(|| MetastoreError::not_found_mapping(id))
        })
    }

    fn get_mappings(&self) -> MetastoreResult<Vec<Mapping>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {MAPPING_COLUMNS} FROM mappings ORDER BY id"))?;
            let rows = stmt.query_map([], map_mapping)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn create_function(&self, function: &NewFunction) -> MetastoreResult<Outcome<FunctionId>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                r#"
                INSERT INTO functions (name, system_name, filename, start_line)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(name, system_name, filename, start_line) DO NOTHING
                "#,
                params![
                    function.name,
                    function.system_name,
                    function.filename,
                    function.start_line
                ],
            )? == 1;

            let id: i64 = tx.query_row(
                r#"
                SELECT id FROM functions
                WHERE name = ?1 AND system_name = ?2 AND filename = ?3 AND start_line = ?4
                "#,
                params![
                    function.name,
                    function.system_name,
                    function.filename,
                    function.start_line
                ],
                |row| row.get(0),
            )?;

            tx.commit()?;
            Ok(Outcome::new(FunctionId(id as u64), inserted))
        })
    }

    fn get_function(&self, id: FunctionId) -> MetastoreResult<Function> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {FUNCTION_COLUMNS} FROM functions WHERE id = ?1"),
                params![id.get() as i64],
                map_function,
            )
            .optional()?
            .ok_or_else(|| MetastoreError::not_found_function(id))
        })
    }

    fn get_functions(&self) -> MetastoreResult<Vec<Function>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {FUNCTION_COLUMNS} FROM functions ORDER BY id"))?;
            let rows = stmt.query_map([], map_function)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn create_location(&self, location: &NewLocation) -> MetastoreResult<Outcome<LocationId>> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            if let Some(mapping_id) = location.mapping_id {
                if !row_exists(&tx, "mappings", mapping_id.get())? {
                    return Err(MetastoreError::not_found_mapping(mapping_id));
                }
            }
            let key = location.key();
            ensure_functions_exist(&tx, &key.lines)?;

            let mapping_column = location.mapping_id.map_or(NO_MAPPING, |m| m.get() as i64);
            let fingerprint = key.lines_fingerprint();
            let inserted = tx.execute(
                r#"
                INSERT INTO locations (mapping_id, address, is_folded, lines_key)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(mapping_id, address, lines_key) DO NOTHING
                "#,
                params![mapping_column, location.address as i64, location.is_folded, fingerprint],
            )? == 1;

            let id: i64 = tx.query_row(
                r#"
                SELECT id FROM locations
                WHERE mapping_id = ?1 AND address = ?2 AND lines_key = ?3
                "#,
                params![mapping_column, location.address as i64, fingerprint],
                |row| row.get(0),
            )?;

            if inserted {
                insert_lines(&tx, id, &key.lines)?;
            }

            tx.commit()?;
            Ok(Outcome::new(LocationId(id as u64), inserted))
        })
    }

    fn get_location(&self, id: LocationId) -> MetastoreResult<Location> {
        self.with_conn(|conn| {
            let location = conn
                .query_row(
                    &format!("SELECT {LOCATION_COLUMNS} FROM locations WHERE id = ?1"),
                    params![id.get() as i64],
                    map_location,
                )
                .optional()?
                .ok_or_else(|| MetastoreError::not_found_location(id))?;

            let mut lines = load_lines(conn, Some(id))?;
            Ok(Location { lines: lines.remove(&id).unwrap_or_default(), ..location })
        })
    }

    fn get_locations(&self) -> MetastoreResult<Vec<Location>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {LOCATION_COLUMNS} FROM locations ORDER BY id"))?;
            let rows = stmt.query_map([], map_location)?;
            let mut lines = load_lines(conn, None)?;

            let mut out = Vec::new();
            for row in rows {
                let location = row?;
                let location_lines = lines.remove(&location.id).unwrap_or_default();
                out.push(Location { lines: location_lines, ..location });
            }
            Ok(out)
        })
    }

    fn get_unsymbolized_locations(&self) -> MetastoreResult<Vec<Location>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT l.id, l.mapping_id, l.address, l.is_folded
                FROM locations l
                JOIN mappings m ON m.id = l.mapping_id
                WHERE m.build_id != ''
                  AND l.address != 0
                  AND NOT EXISTS (SELECT 1 FROM lines WHERE lines.location_id = l.id)
                ORDER BY l.id
                "#,
            )?;
            let rows = stmt.query_map([], map_location)?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    fn set_lines(&self, id: LocationId, lines: &[Line]) -> MetastoreResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            if !row_exists(&tx, "locations", id.get())? {
                return Err(MetastoreError::not_found_location(id));
            }
            ensure_functions_exist(&tx, lines)?;
            if lines.is_empty() {
                return Ok(());
            }

            let symbolized: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM lines WHERE location_id = ?1)",
                params![id.get() as i64],
                |row| row.get(0),
            )?;
            if symbolized {
                return Err(MetastoreError::AlreadySymbolized(id));
            }

            insert_lines(&tx, id.get() as i64, lines)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn ping(&self) -> MetastoreResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    fn close(&self) -> MetastoreResult<()> {
        let mut guard = self.conn.lock().map_err(|_| MetastoreError::Poisoned)?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| MetastoreError::Unavailable(e))?;
        }
        Ok(())
    }
}

const MAPPING_COLUMNS: &str = "id, memory_start, memory_limit, file_offset, file, build_id, \
     has_functions, has_filenames, has_line_numbers, has_inline_frames";

const FUNCTION_COLUMNS: &str = "id, name, system_name, filename, start_line";

const LOCATION_COLUMNS: &str = "id, mapping_id, address, is_folded";

fn map_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<Mapping> {
    Ok(Mapping {
        id: MappingId(row.get::<_, i64>(0)? as u64),
        start: row.get::<_, i64>(1)? as u64,
        limit: row.get::<_, i64>(2)? as u64,
        offset: row.get::<_, i64>(3)? as u64,
        file: row.get(4)?,
        build_id: row.get(5)?,
        flags: MappingFlags {
            has_functions: row.get(6)?,
            has_filenames: row.get(7)?,
            has_line_numbers: row.get(8)?,
            has_inline_frames: row.get(9)?,
        },
    })
}

fn map_function(row: &rusqlite::Row<'_>) -> rusqlite::Result<Function> {
    Ok(Function {
        id: FunctionId(row.get::<_, i64>(0)? as u64),
        name: row.get(1)?,
        system_name: row.get(2)?,
        filename: row.get(3)?,
        start_line: row.get(4)?,
    })
}

/// Maps a location row without its lines; callers attach them.
fn map_location(row: &rusqlite::Row<'_>) -> rusqlite::Result<Location> {
    let mapping_id: i64 = row.get(1)?;
    Ok(Location {
        id: LocationId(row.get::<_, i64>(0)? as u64),
        mapping_id: (mapping_id != NO_MAPPING).then_some(MappingId(mapping_id as u64)),
        address: row.get::<_, i64>(2)? as u64,
        is_folded: row.get(3)?,
        lines: Vec::new(),
    })
}

fn row_exists(tx: &Transaction<'_>, table: &str, id: u64) -> MetastoreResult<bool> {
    let exists: bool = tx.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {table} WHERE id = ?1)"),
        params![id as i64],
        |row| row.get(0),
    )?;
    Ok(exists)
}

fn ensure_functions_exist(tx: &Transaction<'_>, lines: &[Line]) -> MetastoreResult<()> {
    for line in lines {
        if !row_exists(tx, "functions", line.function_id.get())? {
            return Err(MetastoreError::not_found_function(line.function_id));
        }
    }
    Ok(())
}

fn insert_lines(tx: &Transaction<'_>, location_id: i64, lines: &[Line]) -> MetastoreResult<()> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO lines (location_id, idx, function_id, line)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )?;
    for (idx, line) in lines.iter().enumerate() {
        stmt.execute(params![location_id, idx as i64, line.function_id.get() as i64, line.line])?;
    }
    Ok(())
}

/// Load lines grouped by location, in inline order. `only` restricts to one location.
fn load_lines(
    conn: &Connection,
    only: Option<LocationId>,
) -> MetastoreResult<HashMap<LocationId, Vec<Line>>> {
    fn map_line(row: &rusqlite::Row<'_>) -> rusqlite::Result<(LocationId, Line)> {
        Ok((
            LocationId(row.get::<_, i64>(0)? as u64),
            Line {
                function_id: FunctionId(row.get::<_, i64>(1)? as u64),
                line: row.get(2)?,
            },
        ))
    }

    let mut stmt = if only.is_some() {
        conn.prepare(
            r#"
            SELECT location_id, function_id, line FROM lines
            WHERE location_id = ?1
            ORDER BY idx
            "#,
        )?
    } else {
        conn.prepare(
            r#"
            SELECT location_id, function_id, line FROM lines
            ORDER BY location_id, idx
            "#,
        )?
    };

    let rows = if let Some(id) = only {
        stmt.query_map(params![id.get() as i64], map_line)?
    } else {
        stmt.query_map([], map_line)?
    };

    let mut out: HashMap<LocationId, Vec<Line>> = HashMap::new();
    for row in rows {
        let (location_id, line) = row?;
        out.entry(location_id).or_default().push(line);
    }
    Ok(out)
}

/// Apply schema migrations to bring the database to the latest version.
///
/// We use `PRAGMA user_version` as the schema version indicator.
///
/// Version map:
/// - 0: no schema
/// - 1: mappings, functions, locations
/// - 2: lines table for symbolized locations
fn apply_migrations(conn: &Connection) -> MetastoreResult<()> {
    let mut current_version = current_schema_version(conn)?;

    // Reject DBs created with a newer schema than we support.
    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(MetastoreError::UnsupportedSchemaVersion {
            found: current_version,
            min_supported: MIN_SUPPORTED_SCHEMA_VERSION,
            max_supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if current_version == 0 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS mappings (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id          TEXT NOT NULL,
                file              TEXT NOT NULL,
                memory_start      INTEGER NOT NULL,
                memory_limit      INTEGER NOT NULL,
                file_offset       INTEGER NOT NULL,
                has_functions     INTEGER NOT NULL DEFAULT 0,
                has_filenames     INTEGER NOT NULL DEFAULT 0,
                has_line_numbers  INTEGER NOT NULL DEFAULT 0,
                has_inline_frames INTEGER NOT NULL DEFAULT 0,
                UNIQUE(build_id, file)
            );

            CREATE TABLE IF NOT EXISTS functions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL,
                system_name TEXT NOT NULL,
                filename    TEXT NOT NULL,
                start_line  INTEGER NOT NULL,
                UNIQUE(name, system_name, filename, start_line)
            );

            CREATE TABLE IF NOT EXISTS locations (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                mapping_id INTEGER NOT NULL,
                address    INTEGER NOT NULL,
                is_folded  INTEGER NOT NULL DEFAULT 0,
                lines_key  TEXT NOT NULL DEFAULT '',
                UNIQUE(mapping_id, address, lines_key)
            );

            PRAGMA user_version = 1;
            COMMIT;
            "#,
        )?;
        current_version = 1;
    }

    if current_version < 2 {
        conn.execute_batch(
            r#"
            BEGIN;
            CREATE TABLE IF NOT EXISTS lines (
                location_id INTEGER NOT NULL,
                idx         INTEGER NOT NULL,
                function_id INTEGER NOT NULL,
                line        INTEGER NOT NULL,
                PRIMARY KEY(location_id, idx)
            );

            PRAGMA user_version = 2;
            COMMIT;
            "#,
        )?;
    }

    Ok(())
}

/// Read the SQLite schema version from `PRAGMA user_version`.
fn current_schema_version(conn: &Connection) -> MetastoreResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    Ok(version)
}
