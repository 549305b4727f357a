//! Trace persistence
//!
//! Stores are append-only: a record is written once per request id and never
//! replaced.
//!
//! # Directory layout of [`FileTraceStore`]
//!
//! ```text
//! traces/
//! ├── 6f1c...-request.json
//! └── 9a2e...-request.json.zst
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::trace::TraceRecord;
use crate::error::TraceStoreError;

/// Append-only store of trace records keyed by request id
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Persist a finished trace; rejects a request id that already exists
    async fn append(&self, trace: &TraceRecord) -> Result<(), TraceStoreError>;

    async fn load(&self, request_id: &str) -> Result<Option<TraceRecord>, TraceStoreError>;

    /// All stored request ids, sorted
    async fn list(&self) -> Result<Vec<String>, TraceStoreError>;

    /// Every trace recorded for one graph, oldest first
    async fn list_for_graph(&self, graph_id: &str) -> Result<Vec<TraceRecord>, TraceStoreError> {
        let mut traces = Vec::new();
        for request_id in self.list().await? {
            if let Some(trace) = self.load(&request_id).await? {
                if trace.graph_id == graph_id {
                    traces.push(trace);
                }
            }
        }
        traces.sort_by_key(|t| t.started_at);
        Ok(traces)
    }
}

/// In-memory store for tests and short-lived processes
#[derive(Debug, Default)]
pub struct MemoryTraceStore {
    traces: RwLock<BTreeMap<String, TraceRecord>>,
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.traces.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.traces.read().await.is_empty()
    }
}

#[async_trait]
impl TraceStore for MemoryTraceStore {
    async fn append(&self, trace: &TraceRecord) -> Result<(), TraceStoreError> {
        let mut traces = self.traces.write().await;
        if traces.contains_key(&trace.request_id) {
            return Err(TraceStoreError::AlreadyExists(trace.request_id.clone()));
        }
        traces.insert(trace.request_id.clone(), trace.clone());
        Ok(())
    }

    async fn load(&self, request_id: &str) -> Result<Option<TraceRecord>, TraceStoreError> {
        Ok(self.traces.read().await.get(request_id).cloned())
    }

    async fn list(&self) -> Result<Vec<String>, TraceStoreError> {
        Ok(self.traces.read().await.keys().cloned().collect())
    }
}

/// One JSON file per request, optionally zstd-compressed.
///
/// Writes go to a temporary file that is renamed into place.
#[derive(Debug, Clone)]
pub struct FileTraceStore {
    dir: PathBuf,
    compression: bool,
}

impl FileTraceStore {
    pub fn new(dir: impl Into<PathBuf>, compression: bool) -> Self {
        Self {
            dir: dir.into(),
            compression,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Request ids become file names; anything outside `[A-Za-z0-9_-]` is replaced
    fn file_stem(request_id: &str) -> String {
        request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    fn plain_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::file_stem(request_id)))
    }

    fn compressed_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.zst", Self::file_stem(request_id)))
    }

    fn temp_path(&self, request_id: &str) -> PathBuf {
        self.dir.join(format!("{}.tmp", Self::file_stem(request_id)))
    }

    fn compress(data: &[u8]) -> Result<Vec<u8>, TraceStoreError> {
        let mut encoder = zstd::stream::Encoder::new(Vec::new(), 3)
            .map_err(|e| TraceStoreError::Compression(e.to_string()))?;
        encoder
            .write_all(data)
            .map_err(|e| TraceStoreError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| TraceStoreError::Compression(e.to_string()))
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>, TraceStoreError> {
        zstd::stream::decode_all(data).map_err(|e| TraceStoreError::Compression(e.to_string()))
    }

    fn request_id_of(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        name.strip_suffix(".json.zst")
            .or_else(|| name.strip_suffix(".json"))
            .map(str::to_string)
    }
}

#[async_trait]
impl TraceStore for FileTraceStore {
    async fn append(&self, trace: &TraceRecord) -> Result<(), TraceStoreError> {
        fs::create_dir_all(&self.dir).await.map_err(TraceStoreError::io)?;

        let id = &trace.request_id;
        if self.plain_path(id).exists() || self.compressed_path(id).exists() {
            return Err(TraceStoreError::AlreadyExists(id.clone()));
        }

        let json = serde_json::to_vec_pretty(trace).map_err(TraceStoreError::serialization)?;
        let (data, final_path) = if self.compression {
            (Self::compress(&json)?, self.compressed_path(id))
        } else {
            (json, self.plain_path(id))
        };

        let temp_path = self.temp_path(id);
        let mut file = fs::File::create(&temp_path).await.map_err(TraceStoreError::io)?;
        file.write_all(&data).await.map_err(TraceStoreError::io)?;
        file.sync_all().await.map_err(TraceStoreError::io)?;
        fs::rename(&temp_path, &final_path)
            .await
            .map_err(TraceStoreError::io)?;

        tracing::debug!(request_id = %id, path = %final_path.display(), "Trace persisted");
        Ok(())
    }

    async fn load(&self, request_id: &str) -> Result<Option<TraceRecord>, TraceStoreError> {
        let compressed = self.compressed_path(request_id);
        let plain = self.plain_path(request_id);

        let data = if compressed.exists() {
            Self::decompress(&fs::read(&compressed).await.map_err(TraceStoreError::io)?)?
        } else if plain.exists() {
            fs::read(&plain).await.map_err(TraceStoreError::io)?
        } else {
            return Ok(None);
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(TraceStoreError::serialization)
    }

    async fn list(&self) -> Result<Vec<String>, TraceStoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&self.dir).await.map_err(TraceStoreError::io)?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(TraceStoreError::io)? {
            if let Some(id) = Self::request_id_of(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
