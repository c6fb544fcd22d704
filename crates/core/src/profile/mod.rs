//! Decoding of raw pprof profiles into a self-contained symbol graph.
//!
//! Profile-local ids (as found on the wire) are kept as plain `u64`s; ingestion
//! maps them onto canonical metastore ids.

use std::collections::HashSet;
use std::io::Read;

use flate2::read::GzDecoder;
use prost::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{MappingFlags, NewFunction, NewMapping};

pub mod pprof;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("failed to decompress profile: {0}")]
    Decompress(#[source] std::io::Error),
    #[error("failed to decode profile: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("invalid profile: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ProfileError {
    ProfileError::Invalid(msg.into())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleType {
    pub r#type: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMapping {
    pub id: u64,
    pub mapping: NewMapping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileFunction {
    pub id: u64,
    pub function: NewFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProfileLine {
    pub function_id: u64,
    pub line: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLocation {
    pub id: u64,
    pub mapping_id: Option<u64>,
    pub address: u64,
    pub is_folded: bool,
    /// Innermost first.
    pub lines: Vec<ProfileLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelValue {
    Str(String),
    Num { num: i64, unit: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleLabel {
    pub key: String,
    pub value: LabelValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSample {
    /// Leaf first.
    pub location_ids: Vec<u64>,
    pub values: Vec<i64>,
    pub labels: Vec<SampleLabel>,
}

/// A parsed and validated profile with its string table resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileGraph {
    pub sample_types: Vec<SampleType>,
    pub period_type: Option<SampleType>,
    pub period: i64,
    pub time_nanos: i64,
    pub duration_nanos: i64,
    pub mappings: Vec<ProfileMapping>,
    pub functions: Vec<ProfileFunction>,
    pub locations: Vec<ProfileLocation>,
    pub samples: Vec<ProfileSample>,
}

impl ProfileGraph {
    /// Parse raw profile bytes, gzip-compressed or not.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProfileError> {
        let profile = if bytes.starts_with(&GZIP_MAGIC) {
            let mut decoded = Vec::new();
            GzDecoder::new(bytes).read_to_end(&mut decoded).map_err(ProfileError::Decompress)?;
            pprof::Profile::decode(decoded.as_slice())?
        } else {
            pprof::Profile::decode(bytes)?
        };
        Self::from_pprof(&profile)
    }

    /// Validate a decoded profile and resolve its string table.
    pub fn from_pprof(profile: &pprof::Profile) -> Result<Self, ProfileError> {
        let strings = StringTable::new(&profile.string_table)?;

        let sample_types = profile
            .sample_type
            .iter()
            .map(|vt| strings.value_type(vt))
            .collect::<Result<Vec<_>, _>>()?;
        let period_type =
            profile.period_type.as_ref().map(|vt| strings.value_type(vt)).transpose()?;

        let mut mapping_ids = HashSet::new();
        let mut mappings = Vec::with_capacity(profile.mapping.len());
        for m in &profile.mapping {
            if m.id == 0 || !mapping_ids.insert(m.id) {
                return Err(invalid(format!("mapping id {} is zero or duplicated", m.id)));
            }
            mappings.push(ProfileMapping {
                id: m.id,
                mapping: NewMapping {
                    start: m.memory_start,
                    limit: m.memory_limit,
                    offset: m.file_offset,
                    file: strings.get(m.filename)?.to_string(),
                    build_id: strings.get(m.build_id)?.to_string(),
                    flags: MappingFlags {
                        has_functions: m.has_functions,
                        has_filenames: m.has_filenames,
                        has_line_numbers: m.has_line_numbers,
                        has_inline_frames: m.has_inline_frames,
                    },
                },
            });
        }

        let mut function_ids = HashSet::new();
        let mut functions = Vec::with_capacity(profile.function.len());
        for f in &profile.function {
            if f.id == 0 || !function_ids.insert(f.id) {
                return Err(invalid(format!("function id {} is zero or duplicated", f.id)));
            }
            functions.push(ProfileFunction {
                id: f.id,
                function: NewFunction {
                    name: strings.get(f.name)?.to_string(),
                    system_name: strings.get(f.system_name)?.to_string(),
                    filename: strings.get(f.filename)?.to_string(),
                    start_line: f.start_line,
                },
            });
        }

        let mut location_ids = HashSet::new();
        let mut locations = Vec::with_capacity(profile.location.len());
        for l in &profile.location {
            if l.id == 0 || !location_ids.insert(l.id) {
                return Err(invalid(format!("location id {} is zero or duplicated", l.id)));
            }
            let mapping_id = match l.mapping_id {
                0 => None,
                id if mapping_ids.contains(&id) => Some(id),
                id => {
                    return Err(invalid(format!(
                        "location {} references unknown mapping {id}",
                        l.id
                    )))
                }
            };
            let mut lines = Vec::with_capacity(l.line.len());
            for line in &l.line {
                if !function_ids.contains(&line.function_id) {
                    return Err(invalid(format!(
                        "location {} references unknown function {}",
                        l.id, line.function_id
                    )));
                }
                lines.push(ProfileLine { function_id: line.function_id, line: line.line });
            }
            locations.push(ProfileLocation {
                id: l.id,
                mapping_id,
                address: l.address,
                is_folded: l.is_folded,
                lines,
            });
        }

        let mut samples = Vec::with_capacity(profile.sample.len());
        for (idx, s) in profile.sample.iter().enumerate() {
            if s.value.len() != sample_types.len() {
                return Err(invalid(format!(
                    "sample {idx} has {} values, expected {}",
                    s.value.len(),
                    sample_types.len()
                )));
            }
            if let Some(unknown) = s.location_id.iter().find(|id| !location_ids.contains(*id)) {
                return Err(invalid(format!("sample {idx} references unknown location {unknown}")));
            }
            let labels = s
                .label
                .iter()
                .map(|label| strings.label(label))
                .collect::<Result<Vec<_>, _>>()?;
            samples.push(ProfileSample {
                location_ids: s.location_id.clone(),
                values: s.value.clone(),
                labels,
            });
        }

        Ok(ProfileGraph {
            sample_types,
            period_type,
            period: profile.period,
            time_nanos: profile.time_nanos,
            duration_nanos: profile.duration_nanos,
            mappings,
            functions,
            locations,
            samples,
        })
    }
}

struct StringTable<'a> {
    strings: &'a [String],
}

impl<'a> StringTable<'a> {
    fn new(strings: &'a [String]) -> Result<Self, ProfileError> {
        match strings.first() {
            Some(first) if first.is_empty() => Ok(Self { strings }),
            // An entirely empty profile has no string table at all.
            None => Ok(Self { strings }),
            Some(_) => Err(invalid("string_table[0] must be empty")),
        }
    }

    fn get(&self, idx: i64) -> Result<&'a str, ProfileError> {
        if idx == 0 {
            return Ok("");
        }
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.strings.get(i))
            .map(String::as_str)
            .ok_or_else(|| invalid(format!("string index {idx} out of range")))
    }

    fn value_type(&self, vt: &pprof::ValueType) -> Result<SampleType, ProfileError> {
        Ok(SampleType {
            r#type: self.get(vt.r#type)?.to_string(),
            unit: self.get(vt.unit)?.to_string(),
        })
    }

    fn label(&self, label: &pprof::Label) -> Result<SampleLabel, ProfileError> {
        let key = self.get(label.key)?.to_string();
        let value = if label.str != 0 {
            LabelValue::Str(self.get(label.str)?.to_string())
        } else {
            let unit = self.get(label.num_unit)?;
            LabelValue::Num {
                num: label.num,
                unit: (!unit.is_empty()).then(|| unit.to_string()),
            }
        };
        Ok(SampleLabel { key, value })
    }
}
