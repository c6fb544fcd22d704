// Fixtures shared by the CLI tests.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use prost::Message;
use profstore_core::profile::pprof;

pub const GO_BUILD_ID: &str = "2d6912fd3dd64542f6f6294f4bf9cb6c265b3085";
pub const GO_ADDRESS: u64 = 0x463781;

/// A one-location Go CPU profile with no symbols, written to `dir/cpu.pprof`.
pub fn write_go_profile(dir: &Path) -> PathBuf {
    let strings = ["", "samples", "count", "/bin/pprof-labels-example", GO_BUILD_ID];
    let profile = pprof::Profile {
        sample_type: vec![pprof::ValueType { r#type: 1, unit: 2 }],
        sample: vec![pprof::Sample { location_id: vec![1], value: vec![10], label: Vec::new() }],
        mapping: vec![pprof::Mapping {
            id: 1,
            memory_start: 4194304,
            memory_limit: 4603904,
            filename: 3,
            build_id: 4,
            ..Default::default()
        }],
        location: vec![pprof::Location {
            id: 1,
            mapping_id: 1,
            address: GO_ADDRESS,
            line: Vec::new(),
            is_folded: false,
        }],
        string_table: strings.iter().map(|s| s.to_string()).collect(),
        time_nanos: 1_609_459_200_000_000_000,
        ..Default::default()
    };

    let path = dir.join("cpu.pprof");
    fs::write(&path, profile.encode_to_vec()).expect("write profile");
    path
}

/// Symbol table answering the Go profile's only address with an inlined pair.
pub fn write_go_symbols(dir: &Path) -> PathBuf {
    let json = format!(
        r#"{{
    "{GO_BUILD_ID}": {{
        "{GO_ADDRESS:#x}": [
            {{"function_name": "main.main", "filename": "main.go", "line": 10}},
            {{"function_name": "main.iterate", "filename": "main.go", "line": 27}}
        ]
    }}
}}"#
    );
    let path = dir.join("symbols.json");
    fs::write(&path, json).expect("write symbols");
    path
}
