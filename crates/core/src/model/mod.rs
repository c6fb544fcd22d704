//! Core data model for the symbol metastore.
//!
//! Four entities make up a profile's symbol graph:
//! - `Mapping`: a loaded binary, identified by build ID and file path.
//! - `Function`: a named source-level function.
//! - `Location`: one address inside one mapping; the unit of symbolization.
//! - `Line`: one frame of a location's inlining chain, innermost first.
//!
//! Identifiers are assigned by the store and are never zero.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Canonical identifier of a stored mapping.
    MappingId
);
id_type!(
    /// Canonical identifier of a stored function.
    FunctionId
);
id_type!(
    /// Canonical identifier of a stored location.
    LocationId
);

/// Result of a get-or-create call: the canonical id and whether this call created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome<I> {
    pub id: I,
    pub created: bool,
}

impl<I> Outcome<I> {
    pub fn new(id: I, created: bool) -> Self {
        Self { id, created }
    }
}

/// Symbol-resolution capabilities advertised for a mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingFlags {
    pub has_functions: bool,
    pub has_filenames: bool,
    pub has_line_numbers: bool,
    pub has_inline_frames: bool,
}

impl MappingFlags {
    /// Union of two flag sets. Flags only ever gain information.
    pub fn merge(self, other: MappingFlags) -> MappingFlags {
        MappingFlags {
            has_functions: self.has_functions || other.has_functions,
            has_filenames: self.has_filenames || other.has_filenames,
            has_line_numbers: self.has_line_numbers || other.has_line_numbers,
            has_inline_frames: self.has_inline_frames || other.has_inline_frames,
        }
    }
}

/// Mapping as presented by a profile, before it has a canonical id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMapping {
    pub start: u64,
    pub limit: u64,
    pub offset: u64,
    pub file: String,
    pub build_id: String,
    #[serde(default)]
    pub flags: MappingFlags,
}

impl NewMapping {
    pub fn new(build_id: impl Into<String>, file: impl Into<String>) -> Self {
        Self { build_id: build_id.into(), file: file.into(), ..Default::default() }
    }

    /// Builder-style helper to set the load range.
    pub fn with_range(mut self, start: u64, limit: u64, offset: u64) -> Self {
        self.start = start;
        self.limit = limit;
        self.offset = offset;
        self
    }

    /// Dedup key: load-address fields are deliberately left out.
    pub fn key(&self) -> MappingKey {
        MappingKey { build_id: self.build_id.clone(), file: self.file.clone() }
    }
}

/// Normalized content key of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub build_id: String,
    pub file: String,
}

/// Stored mapping.
///
/// `start`, `limit` and `offset` are those of the first sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub id: MappingId,
    pub start: u64,
    pub limit: u64,
    pub offset: u64,
    pub file: String,
    pub build_id: String,
    pub flags: MappingFlags,
}

impl Mapping {
    pub fn from_new(id: MappingId, new: &NewMapping) -> Self {
        Self {
            id,
            start: new.start,
            limit: new.limit,
            offset: new.offset,
            file: new.file.clone(),
            build_id: new.build_id.clone(),
            flags: new.flags,
        }
    }

    /// Mappings without a build ID can never be matched against debug info.
    pub fn is_symbolizable(&self) -> bool {
        !self.build_id.is_empty()
    }
}

/// Function as presented by a profile or a debug-info lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewFunction {
    pub name: String,
    pub system_name: String,
    pub filename: String,
    pub start_line: i64,
}

impl NewFunction {
    pub fn new(name: impl Into<String>, filename: impl Into<String>) -> Self {
        Self { name: name.into(), filename: filename.into(), ..Default::default() }
    }

    pub fn with_system_name(mut self, system_name: impl Into<String>) -> Self {
        self.system_name = system_name.into();
        self
    }

    pub fn with_start_line(mut self, start_line: i64) -> Self {
        self.start_line = start_line;
        self
    }
}

/// Normalized content key of a function: every field participates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionKey {
    pub name: String,
    pub system_name: String,
    pub filename: String,
    pub start_line: i64,
}

impl From<&NewFunction> for FunctionKey {
    fn from(f: &NewFunction) -> Self {
        Self {
            name: f.name.clone(),
            system_name: f.system_name.clone(),
            filename: f.filename.clone(),
            start_line: f.start_line,
        }
    }
}

/// Stored function. The full tuple of fields is its dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub system_name: String,
    pub filename: String,
    pub start_line: i64,
}

impl Function {
    pub fn from_new(id: FunctionId, new: &NewFunction) -> Self {
        Self {
            id,
            name: new.name.clone(),
            system_name: new.system_name.clone(),
            filename: new.filename.clone(),
            start_line: new.start_line,
        }
    }
}

/// One frame of a location's inline chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Line {
    pub function_id: FunctionId,
    pub line: i64,
}

impl Line {
    pub fn new(function_id: FunctionId, line: i64) -> Self {
        Self { function_id, line }
    }
}

/// Location as presented by a profile, referencing an already canonical mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLocation {
    pub mapping_id: Option<MappingId>,
    pub address: u64,
    pub is_folded: bool,
    /// Only consulted for locations that are not addressable (see [`NewLocation::is_addressable`]),
    /// where the lines become part of the identity and are stored at creation.
    #[serde(default)]
    pub lines: Vec<Line>,
}

impl NewLocation {
    pub fn new(mapping_id: MappingId, address: u64) -> Self {
        Self { mapping_id: Some(mapping_id), address, ..Default::default() }
    }

    /// A location without a mapping, or at address zero, cannot be symbolized later.
    pub fn is_addressable(&self) -> bool {
        self.mapping_id.is_some() && self.address != 0
    }

    pub fn key(&self) -> LocationKey {
        LocationKey {
            mapping_id: self.mapping_id,
            address: self.address,
            lines: if self.is_addressable() { Vec::new() } else { self.lines.clone() },
        }
    }
}

/// Normalized content key of a location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationKey {
    pub mapping_id: Option<MappingId>,
    pub address: u64,
    pub lines: Vec<Line>,
}

impl LocationKey {
    /// Text form of the line component, used as a column in SQL backends.
    pub fn lines_fingerprint(&self) -> String {
        self.lines
            .iter()
            .map(|l| format!("{}:{}", l.function_id, l.line))
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Stored location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub mapping_id: Option<MappingId>,
    pub address: u64,
    pub is_folded: bool,
    pub lines: Vec<Line>,
}

impl Location {
    pub fn is_symbolized(&self) -> bool {
        !self.lines.is_empty()
    }
}

/// A line joined with its function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLine {
    pub function: Function,
    pub line: i64,
}

/// A location joined with its mapping and functions, for tooling and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedLocation {
    pub id: LocationId,
    pub address: u64,
    pub is_folded: bool,
    pub mapping: Option<Mapping>,
    pub lines: Vec<ResolvedLine>,
}
