//! Artifact persistence.
//!
//! The orchestrator hands every finished [`Artifact`] to an [`ArtifactStore`]
//! keyed by its id. The contract ends at acceptance: a store failure is logged
//! by the caller and never fails the request that produced the artifact.
//!
//! - `InMemoryArtifactStore`: bounded concurrent map, for tests and demos only
//! - `JsonFileStore`: one `<id>.json` file per artifact in a directory

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Artifact;

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path that was being accessed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Artifact could not be (de)serialised.
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Destination for finished artifacts.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist `artifact` under its id, replacing any previous value.
    async fn save(&self, artifact: &Artifact) -> Result<(), StoreError>;

    /// Fetch an artifact by id.
    async fn load(&self, id: Uuid) -> Result<Option<Artifact>, StoreError>;

    /// Ids of every stored artifact, in no particular order.
    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Artifacts kept by [`InMemoryArtifactStore::new`].
pub const DEFAULT_IN_MEMORY_CAPACITY: usize = 1000;

/// Concurrent in-process store for tests and demos.
///
/// Holds at most `capacity` artifacts. Saving past capacity evicts the oldest
/// saved artifact first. Nothing survives the process; use [`JsonFileStore`]
/// or another [`ArtifactStore`] when artifacts must be kept.
#[derive(Debug, Clone)]
pub struct InMemoryArtifactStore {
    artifacts: Arc<DashMap<Uuid, Artifact>>,
    order: Arc<Mutex<VecDeque<Uuid>>>,
    capacity: usize,
}

impl Default for InMemoryArtifactStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_IN_MEMORY_CAPACITY)
    }
}

impl InMemoryArtifactStore {
    /// Empty store holding up to [`DEFAULT_IN_MEMORY_CAPACITY`] artifacts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store holding up to `capacity` artifacts (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            artifacts: Arc::new(DashMap::new()),
            order: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    /// Maximum number of artifacts kept.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored artifacts.
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn save(&self, artifact: &Artifact) -> Result<(), StoreError> {
        // The order lock serialises saves so map and queue stay in step.
        let mut order = self.order.lock().unwrap_or_else(PoisonError::into_inner);
        if self
            .artifacts
            .insert(artifact.id, artifact.clone())
            .is_none()
        {
            order.push_back(artifact.id);
        }
        while order.len() > self.capacity {
            if let Some(oldest) = order.pop_front() {
                self.artifacts.remove(&oldest);
                warn!(
                    artifact_id = %oldest,
                    capacity = self.capacity,
                    "in-memory store full, evicted oldest artifact"
                );
            }
        }
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Artifact>, StoreError> {
        Ok(self.artifacts.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.artifacts.iter().map(|entry| *entry.key()).collect())
    }
}

/// Stores each artifact as pretty-printed JSON in `<dir>/<id>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `dir`. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl ArtifactStore for JsonFileStore {
    async fn save(&self, artifact: &Artifact) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| io_error(&self.dir, e))?;

        let path = self.path_for(artifact.id);
        let body = serde_json::to_vec_pretty(artifact)?;
        // Write-then-rename so readers never see a partial file.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(artifact_id = %artifact.id, path = %path.display(), "artifact saved");
        Ok(())
    }

    async fn load(&self, id: Uuid) -> Result<Option<Artifact>, StoreError> {
        let path = self.path_for(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn list_ids(&self) -> Result<Vec<Uuid>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&self.dir, e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(&self.dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| Uuid::parse_str(stem).ok())
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}
