use std::fs;

use profstore::{canonicalize_or_current, parse_labels, sha256_hex};
use tempfile::tempdir;

#[test]
fn canonicalize_or_current_returns_cwd_for_dot() {
    let original = std::env::current_dir().expect("cwd");
    let tmp = tempdir().expect("tempdir");
    std::env::set_current_dir(tmp.path()).expect("chdir tmp");

    let result = canonicalize_or_current(".").expect("canonicalize").canonicalize().expect("canon");
    let expected = tmp.path().canonicalize().expect("canon tmp");
    assert_eq!(result, expected);

    std::env::set_current_dir(original).expect("restore cwd");
}

#[test]
fn canonicalize_or_current_handles_existing_and_missing_paths() {
    let tmp = tempdir().expect("tempdir");
    let nested = tmp.path().join("nested");
    fs::create_dir_all(&nested).expect("create nested");

    let existing = canonicalize_or_current(nested.to_str().expect("utf8")).expect("existing");
    assert_eq!(existing, nested.canonicalize().expect("canonicalize nested"));

    let missing = canonicalize_or_current("definitely-not-here-profstore").expect("missing");
    assert!(missing.is_absolute());
    assert!(missing.ends_with("definitely-not-here-profstore"));
}

#[test]
fn sha256_hex_matches_known_digest() {
    assert_eq!(
        sha256_hex(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    );
    assert_eq!(sha256_hex(b"").len(), 64);
}

#[test]
fn parse_labels_accepts_key_value_pairs() {
    let labels = parse_labels(&[
        "service=api".to_string(),
        "region=eu-west=1".to_string(),
        "service=worker".to_string(),
    ])
    .expect("labels");

    assert_eq!(labels.len(), 2);
    assert_eq!(labels.get("service").map(String::as_str), Some("worker"));
    // Only the first '=' separates name from value.
    assert_eq!(labels.get("region").map(String::as_str), Some("eu-west=1"));
    assert!(parse_labels(&[]).expect("empty").is_empty());
}

#[test]
fn parse_labels_rejects_malformed_input() {
    let err = parse_labels(&["service".to_string()]).unwrap_err();
    assert!(err.to_string().contains("expected key=value"), "unexpected error: {err}");

    let err = parse_labels(&[" =x".to_string()]).unwrap_err();
    assert!(err.to_string().contains("empty name"), "unexpected error: {err}");
}
