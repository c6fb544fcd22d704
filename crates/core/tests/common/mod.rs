// Shared fixtures for the core integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use prost::Message;
use profstore_core::profile::pprof;

pub const SCENARIO_A_BUILD_ID: &str = "2d6912fd3dd64542f6f6294f4bf9cb6c265b3085";
pub const SCENARIO_A_FILE: &str =
    "/home/brancz/src/github.com/polarsignals/pprof-labels-example/main.go";
pub const SCENARIO_A_ADDRESS: u64 = 0x463781;

/// Builds pprof messages with an automatically managed string table.
pub struct ProfileBuilder {
    profile: pprof::Profile,
    strings: HashMap<String, i64>,
}

impl ProfileBuilder {
    /// A CPU profile with a single `samples/count` value per sample.
    pub fn new() -> Self {
        let mut builder = Self {
            profile: pprof::Profile { string_table: vec![String::new()], ..Default::default() },
            strings: HashMap::from([(String::new(), 0)]),
        };
        let r#type = builder.intern("samples");
        let unit = builder.intern("count");
        builder.profile.sample_type.push(pprof::ValueType { r#type, unit });
        builder
    }

    fn intern(&mut self, s: &str) -> i64 {
        if let Some(idx) = self.strings.get(s) {
            return *idx;
        }
        let idx = self.profile.string_table.len() as i64;
        self.profile.string_table.push(s.to_string());
        self.strings.insert(s.to_string(), idx);
        idx
    }

    pub fn mapping(mut self, id: u64, build_id: &str, file: &str, start: u64, limit: u64) -> Self {
        let filename = self.intern(file);
        let build_id = self.intern(build_id);
        self.profile.mapping.push(pprof::Mapping {
            id,
            memory_start: start,
            memory_limit: limit,
            filename,
            build_id,
            ..Default::default()
        });
        self
    }

    pub fn function(mut self, id: u64, name: &str, filename: &str) -> Self {
        let name = self.intern(name);
        let filename = self.intern(filename);
        self.profile.function.push(pprof::Function {
            id,
            name,
            system_name: name,
            filename,
            ..Default::default()
        });
        self
    }

    /// `lines` are `(function id, line)` pairs, innermost first.
    pub fn location(
        mut self,
        id: u64,
        mapping_id: u64,
        address: u64,
        lines: &[(u64, i64)],
    ) -> Self {
        self.profile.location.push(pprof::Location {
            id,
            mapping_id,
            address,
            line: lines
                .iter()
                .map(|&(function_id, line)| pprof::Line { function_id, line })
                .collect(),
            is_folded: false,
        });
        self
    }

    pub fn sample(mut self, location_ids: &[u64], value: i64) -> Self {
        self.profile.sample.push(pprof::Sample {
            location_id: location_ids.to_vec(),
            value: vec![value],
            label: Vec::new(),
        });
        self
    }

    pub fn sample_with_label(
        mut self,
        location_ids: &[u64],
        value: i64,
        key: &str,
        val: &str,
    ) -> Self {
        let key = self.intern(key);
        let str_idx = self.intern(val);
        self.profile.sample.push(pprof::Sample {
            location_id: location_ids.to_vec(),
            value: vec![value],
            label: vec![pprof::Label { key, str: str_idx, ..Default::default() }],
        });
        self
    }

    pub fn time_nanos(mut self, time_nanos: i64) -> Self {
        self.profile.time_nanos = time_nanos;
        self
    }

    pub fn build(self) -> pprof::Profile {
        self.profile
    }

    pub fn encode(self) -> Vec<u8> {
        self.profile.encode_to_vec()
    }

    pub fn encode_gzip(self) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.profile.encode_to_vec()).expect("gzip write");
        encoder.finish().expect("gzip finish")
    }
}

/// The single-location Go profile used by the end-to-end symbolization scenario.
pub fn scenario_a_profile() -> ProfileBuilder {
    ProfileBuilder::new()
        .mapping(1, SCENARIO_A_BUILD_ID, "/bin/pprof-labels-example", 4194304, 4603904)
        .location(1, 1, SCENARIO_A_ADDRESS, &[])
        .sample(&[1], 10)
}
