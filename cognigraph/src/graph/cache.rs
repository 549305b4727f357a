//! Validated-graph cache keyed by document content
//!
//! Entries are keyed by the document's content hash together with the
//! registry generation, so an edited document or a hot-swapped registry
//! can never be served a stale graph.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::document::GraphDocument;
use super::model::Graph;
use super::validate::validate_with_snapshot;
use crate::error::ValidationErrors;
use crate::registry::NodeExecutorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

/// Explicit cache passed to whoever validates documents
#[derive(Debug, Default)]
pub struct GraphCache {
    entries: Mutex<HashMap<(String, u64), Arc<Graph>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached graph for this document, validating on a miss.
    /// Rejections are never cached.
    pub fn get_or_validate(
        &self,
        document: &GraphDocument,
        registry: &NodeExecutorRegistry,
    ) -> Result<Arc<Graph>, ValidationErrors> {
        let snapshot = registry.snapshot();
        let key = (document.content_hash(), snapshot.generation());

        if let Some(graph) = self.lock().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(graph.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let graph = Arc::new(validate_with_snapshot(document, &snapshot)?);
        debug!(graph_id = %document.id, hash = %key.0, "Caching validated graph");
        let mut entries = self.lock();
        // Older generations can never be hit again and pin their executors
        let before = entries.len();
        entries.retain(|(_, generation), _| *generation == key.1);
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, generation = key.1, "Dropped graphs from earlier registry generations");
        }
        entries.insert(key, graph.clone());
        Ok(graph)
    }

    /// Drop every entry for a document hash
    pub fn invalidate(&self, content_hash: &str) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(hash, _), _| hash != content_hash);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.lock().len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, u64), Arc<Graph>>> {
        // Entries are plain values; a panic elsewhere cannot leave them half-written
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
