use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use profstore_core::services::LabelSet;
use sha2::{Digest, Sha256};

pub mod commands;

/// Canonicalize the root path if possible, falling back to the given string
/// relative to the current working directory.
pub fn canonicalize_or_current(root: &str) -> Result<PathBuf> {
    let path = Path::new(root);
    if path == Path::new(".") {
        Ok(env::current_dir().context("Failed to get current directory")?)
    } else {
        // Try to canonicalize; if it fails (e.g., path does not yet exist),
        // join it with the current dir to get an absolute path.
        match path.canonicalize() {
            Ok(p) => Ok(p),
            Err(_) => {
                let cwd = env::current_dir().context("Failed to get current directory")?;
                Ok(cwd.join(path))
            }
        }
    }
}

/// SHA-256 of `bytes` as a lowercase hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Parse `key=value` label arguments into a label set.
///
/// Later occurrences of a key override earlier ones.
pub fn parse_labels(args: &[String]) -> Result<LabelSet> {
    let mut labels = LabelSet::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid label '{}': expected key=value", arg))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("Invalid label '{}': empty name", arg));
        }
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}
