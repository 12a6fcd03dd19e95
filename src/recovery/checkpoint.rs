//! Run checkpoints and their stores.

use crate::events::now_ms;
use crate::sizing::ThroughputSample;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Duration;

/// Snapshot of a run's progress. A newer checkpoint replaces the older one.
///
/// `items_consumed` is the length of the contiguous prefix of the item list
/// whose batches have all finished; a resumed run starts right after it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processing_id: String,
    pub timestamp_ms: u64,
    pub processed_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub last_batch_index: Option<usize>,
    pub items_consumed: usize,
    #[serde(default)]
    pub recent_metrics: Vec<ThroughputSample>,
}

impl Checkpoint {
    pub fn new(processing_id: impl Into<String>, total_count: usize) -> Self {
        Self {
            processing_id: processing_id.into(),
            timestamp_ms: now_ms(),
            processed_count: 0,
            failed_count: 0,
            total_count,
            last_batch_index: None,
            items_consumed: 0,
            recent_metrics: Vec::new(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.total_count.saturating_sub(self.items_consumed)
    }

    pub fn is_complete(&self) -> bool {
        self.items_consumed >= self.total_count
    }

    /// Index the next batch of a resumed run gets.
    pub fn next_batch_index(&self) -> usize {
        self.last_batch_index.map_or(0, |i| i + 1)
    }
}

/// When the orchestrator writes checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointPolicy {
    pub enabled: bool,
    /// Write after this many newly finished batches.
    pub every_n_batches: usize,
    /// Never write more often than this.
    pub min_interval_ms: u64,
    /// Also write right after a wave that contained failures.
    pub on_failure: bool,
    /// Throughput samples carried in each checkpoint.
    pub recent_metrics: usize,
    pub delete_on_completion: bool,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            every_n_batches: 10,
            min_interval_ms: 0,
            on_failure: true,
            recent_metrics: 20,
            delete_on_completion: false,
        }
    }
}

impl CheckpointPolicy {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
    pub fn with_every_n_batches(mut self, n: usize) -> Self {
        self.every_n_batches = n;
        self
    }
    pub fn with_min_interval(mut self, d: Duration) -> Self {
        self.min_interval_ms = d.as_millis() as u64;
        self
    }
    pub fn with_on_failure(mut self, on: bool) -> Self {
        self.on_failure = on;
        self
    }
    pub fn with_delete_on_completion(mut self, on: bool) -> Self {
        self.delete_on_completion = on;
        self
    }
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

/// Pluggable checkpoint persistence.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, processing_id: &str, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, processing_id: &str) -> Result<Option<Checkpoint>>;

    async fn delete(&self, _processing_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Process-local store, mostly for tests.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
    saves: AtomicUsize,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn get(&self, processing_id: &str) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(processing_id)
            .cloned()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, processing_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(processing_id.to_string(), checkpoint.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, processing_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.get(processing_id))
    }

    async fn delete(&self, processing_id: &str) -> Result<()> {
        self.checkpoints
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(processing_id);
        Ok(())
    }
}

/// One pretty-printed JSON file per run: `<dir>/<processing_id>.json`.
///
/// Writes go to a temporary sibling first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, processing_id: &str) -> PathBuf {
        let safe: String = processing_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, processing_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(processing_id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load(&self, processing_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.path_for(processing_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, processing_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(processing_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}
