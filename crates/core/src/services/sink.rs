//! Boundary to the time-series storage engine.
//!
//! Ingestion hands every canonicalized profile to a [`SampleSink`]. The engine
//! itself (indexing by label set and time, retention, querying) lives elsewhere.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::model::LocationId;
use crate::profile::{SampleLabel, SampleType};

/// Series label set, ordered by name.
pub type LabelSet = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSample {
    /// Canonical location ids, leaf first.
    pub stack: Vec<LocationId>,
    pub values: Vec<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<SampleLabel>,
}

/// One ingested profile expressed entirely in canonical ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalSeries {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub duration_nanos: i64,
    pub sample_types: Vec<SampleType>,
    pub samples: Vec<CanonicalSample>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write samples to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode samples: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("sample sink lock poisoned")]
    Poisoned,
}

#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn append(&self, series: CanonicalSeries) -> Result<(), SinkError>;
}

/// Keeps every appended series in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    series: Mutex<Vec<CanonicalSeries>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series(&self) -> Vec<CanonicalSeries> {
        self.series.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SampleSink for MemorySink {
    async fn append(&self, series: CanonicalSeries) -> Result<(), SinkError> {
        self.series.lock().map_err(|_| SinkError::Poisoned)?.push(series);
        Ok(())
    }
}

/// Appends one JSON document per series to a file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    // Serializes appends so concurrent writers never interleave lines.
    lock: tokio::sync::Mutex<()>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), lock: tokio::sync::Mutex::new(()) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SampleSink for JsonlSink {
    async fn append(&self, series: CanonicalSeries) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(&series)?;
        line.push(b'\n');

        let io_err = |source| SinkError::Io { path: self.path.clone(), source };
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_err)?;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }
}
