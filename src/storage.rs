//! Blob storage for work descriptors and committed task states.
//!
//! Everything is addressed by (store name, file name). The planner writes
//! descriptors, attempts read them and write task states back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::{Error, Result};
use crate::model::task_state::TASK_STATE_FILE_EXTENSION;
use crate::model::*;

/// A key/value blob store keyed by logical store and file name.
pub trait BlobStore: Send + Sync {
    /// Read a blob. `Ok(None)` when it does not exist.
    fn get(&self, store: &str, file: &str) -> Result<Option<Vec<u8>>>;

    /// Write a blob, replacing any previous content.
    fn put(&self, store: &str, file: &str, data: &[u8]) -> Result<()>;

    /// File names in a store, sorted. Empty if the store does not exist.
    fn list(&self, store: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Filesystem
// ---------------------------------------------------------------------------

/// Stores blobs as `root/store/file`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, store: &str, file: &str) -> PathBuf {
        self.root.join(store).join(file)
    }
}

impl BlobStore for FsBlobStore {
    fn get(&self, store: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(store, file);
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(Error::DescriptorLoad {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn put(&self, store: &str, file: &str, data: &[u8]) -> Result<()> {
        let dir = self.root.join(store);
        let target = dir.join(file);
        let write_failed = |source| Error::BlobWrite {
            path: target.display().to_string(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(write_failed)?;

        // Write-then-rename so readers never see a half-written blob.
        let tmp = dir.join(format!(".{file}.tmp"));
        std::fs::write(&tmp, data).map_err(write_failed)?;
        std::fs::rename(&tmp, &target).map_err(write_failed)?;

        debug!(store, file, bytes = data.len(), "blob written");
        Ok(())
    }

    fn list(&self, store: &str) -> Result<Vec<String>> {
        let dir = self.root.join(store);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory store (for testing).
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlobStore for MemoryBlobStore {
    fn get(&self, store: &str, file: &str) -> Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs.get(&(store.to_string(), file.to_string())).cloned())
    }

    fn put(&self, store: &str, file: &str, data: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        blobs.insert((store.to_string(), file.to_string()), data.to_vec());
        Ok(())
    }

    fn list(&self, store: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(blobs
            .keys()
            .filter(|(s, _)| s == store)
            .map(|(_, f)| f.clone())
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Typed access
// ---------------------------------------------------------------------------

/// Typed view over the descriptor and task-state stores.
///
/// A descriptor file holds a JSON array; only its first entry is used.
/// `.mwu` files hold bundles, anything else holds single units.
#[derive(Clone)]
pub struct StateStores {
    descriptors: Arc<dyn BlobStore>,
    task_states: Arc<dyn BlobStore>,
}

impl StateStores {
    pub fn new(descriptors: Arc<dyn BlobStore>, task_states: Arc<dyn BlobStore>) -> Self {
        Self {
            descriptors,
            task_states,
        }
    }

    /// Descriptors and task states side by side in one store.
    pub fn shared(store: Arc<dyn BlobStore>) -> Self {
        Self::new(Arc::clone(&store), store)
    }

    /// Fetch the descriptor at `location`.
    pub fn load_descriptor(&self, location: &DescriptorLocation) -> Result<WorkDescriptor> {
        let data = self
            .descriptors
            .get(&location.store_name, &location.file_name)?
            .ok_or_else(|| Error::DescriptorNotFound {
                store: location.store_name.clone(),
                file: location.file_name.clone(),
            })?;

        let first = if location.is_bundle() {
            let bundles: Vec<WorkBundle> = serde_json::from_slice(&data)?;
            bundles.into_iter().next().map(WorkDescriptor::Bundle)
        } else {
            let units: Vec<WorkUnit> = serde_json::from_slice(&data)?;
            units.into_iter().next().map(WorkDescriptor::Unit)
        };

        let descriptor = first.ok_or_else(|| Error::EmptyDescriptor {
            store: location.store_name.clone(),
            file: location.file_name.clone(),
        })?;

        debug!(
            location = %location,
            leaves = descriptor.leaf_count(),
            "descriptor loaded"
        );
        Ok(descriptor)
    }

    /// Persist a descriptor where `load_descriptor` will find it.
    pub fn put_descriptor(
        &self,
        location: &DescriptorLocation,
        descriptor: &WorkDescriptor,
    ) -> Result<()> {
        let data = match (location.is_bundle(), descriptor) {
            (true, WorkDescriptor::Bundle(b)) => serde_json::to_vec(std::slice::from_ref(b))?,
            (false, WorkDescriptor::Unit(u)) => serde_json::to_vec(std::slice::from_ref(u))?,
            (true, WorkDescriptor::Unit(_)) => {
                return Err(Error::Other(format!("{location} is a bundle file, got a unit")));
            }
            (false, WorkDescriptor::Bundle(_)) => {
                return Err(Error::Other(format!("{location} is a unit file, got a bundle")));
            }
        };
        self.descriptors
            .put(&location.store_name, &location.file_name, &data)
    }

    /// Commit task states under the job's store.
    pub fn commit_task_states(&self, job_id: &JobId, states: &[TaskState]) -> Result<()> {
        for state in states {
            let data = serde_json::to_vec_pretty(state)?;
            self.task_states
                .put(job_id.as_str(), &state.file_name(), &data)?;
        }
        Ok(())
    }

    /// Every task state committed for a job, in the order the tasks started.
    pub fn task_states(&self, job_id: &JobId) -> Result<Vec<TaskState>> {
        let mut states = Vec::new();
        for file in self.task_states.list(job_id.as_str())? {
            if !file.ends_with(TASK_STATE_FILE_EXTENSION) {
                continue;
            }
            if let Some(data) = self.task_states.get(job_id.as_str(), &file)? {
                states.push(serde_json::from_slice::<TaskState>(&data)?);
            }
        }
        states.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(states)
    }
}
