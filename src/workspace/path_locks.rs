//! Per-path lock arena.
//!
//! Each checkout path maps to a reference-counted `RwLock`. Git mutation
//! takes the write side; step execution holds the read side so a checkout is
//! never updated underneath a running Terraform process. Entries are created
//! on demand and only pruned while no handle to them is alive.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

#[derive(Debug, Default)]
pub struct PathLocks {
    locks: DashMap<PathBuf, Arc<RwLock<()>>>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, path: &Path) -> Arc<RwLock<()>> {
        self.locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Exclusive access to `path`, for clone/fetch/merge/delete.
    pub async fn write(&self, path: &Path) -> OwnedRwLockWriteGuard<()> {
        self.handle(path).write_owned().await
    }

    /// Shared access to `path`, held while steps run inside it.
    pub async fn read(&self, path: &Path) -> OwnedRwLockReadGuard<()> {
        self.handle(path).read_owned().await
    }

    /// Drop the entry for `path` if the map holds the only reference.
    pub fn prune(&self, path: &Path) {
        self.locks.remove_if(path, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
