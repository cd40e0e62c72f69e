//! Durable record of the last fully dispatched chain position.
//!
//! The checkpoint is the watcher's restart anchor: catch-up scans cover
//! `(checkpoint.block_number, head]`, so the stored value must only ever move
//! forward. Writes are compare-and-set: a write that would regress the block
//! number is rejected, protecting against concurrent relay instances.

use std::path::PathBuf;

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::RelayError;

/// The last chain position known to be fully dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub block_number: u64,
    pub block_hash: B256,
}

/// Storage contract for the checkpoint.
///
/// `write` has compare-and-set semantics: it must fail with
/// [`RelayError::CheckpointConflict`] instead of regressing the stored block
/// number. Equal block numbers are accepted since several events can share a
/// block; the value is non-decreasing, not strictly increasing.
pub trait CheckpointStore: Send + Sync + 'static {
    fn read(&self) -> impl Future<Output = Result<Option<Checkpoint>, RelayError>> + Send;

    fn write(&self, checkpoint: Checkpoint) -> impl Future<Output = Result<(), RelayError>> + Send;
}

impl<C: CheckpointStore> CheckpointStore for std::sync::Arc<C> {
    async fn read(&self) -> Result<Option<Checkpoint>, RelayError> {
        (**self).read().await
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<(), RelayError> {
        (**self).write(checkpoint).await
    }
}

fn check_monotonic(stored: Option<Checkpoint>, proposed: Checkpoint) -> Result<(), RelayError> {
    match stored {
        Some(stored) if proposed.block_number < stored.block_number => {
            Err(RelayError::CheckpointConflict {
                stored: stored.block_number,
                proposed: proposed.block_number,
            })
        }
        _ => Ok(()),
    }
}

/// In-process checkpoint store for tests and single-shot runs.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    inner: std::sync::Mutex<Option<Checkpoint>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_checkpoint(checkpoint: Checkpoint) -> Self {
        Self { inner: std::sync::Mutex::new(Some(checkpoint)) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Checkpoint>> {
        // a poisoned lock only means a panicking test; the value itself is a Copy
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn read(&self) -> Result<Option<Checkpoint>, RelayError> {
        Ok(*self.lock())
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<(), RelayError> {
        let mut stored = self.lock();
        check_monotonic(*stored, checkpoint)?;
        *stored = Some(checkpoint);
        Ok(())
    }
}

/// File-backed checkpoint store.
///
/// The checkpoint is a small JSON document written to a temporary file and
/// atomically renamed into place, so a crash mid-write never leaves a torn
/// checkpoint. Compare-and-set is enforced against the on-disk value under an
/// in-process mutex; deployments with multiple relay processes should use a
/// database-backed store instead.
#[derive(Debug)]
pub struct FileCheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCheckpointStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    async fn read_file(&self) -> Result<Option<Checkpoint>, RelayError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl CheckpointStore for FileCheckpointStore {
    async fn read(&self) -> Result<Option<Checkpoint>, RelayError> {
        let _guard = self.lock.lock().await;
        self.read_file().await
    }

    async fn write(&self, checkpoint: Checkpoint) -> Result<(), RelayError> {
        let _guard = self.lock.lock().await;
        check_monotonic(self.read_file().await?, checkpoint)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&checkpoint)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
