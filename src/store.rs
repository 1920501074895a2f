//! The output store: maps a job id to the directory holding that job's
//! results.  Because ids are content-addressed, the store doubles as the
//! build cache.
//!
//! Filesystem layout: `<root>/ab/ab12...` per id, plus `<root>/tmp` where
//! in-flight work is staged.  Staging lives inside the store root so the
//! final publish is a single same-filesystem rename.

use crate::id::Id;
use dashmap::DashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("open store at {path:?}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("stage output for {id}: {source}")]
    Stage { id: Id, source: io::Error },
    #[error("publish output for {id}: {source}")]
    Publish { id: Id, source: io::Error },
}

/// A directory a job runs in before its output is published.  Dropping it
/// without a commit removes the directory, so failed jobs leave nothing
/// behind.
pub struct Staging {
    id: Id,
    dir: tempfile::TempDir,
}

impl Staging {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Key-value repository of job outputs.  `lookup` answers the cache check;
/// `begin`/`commit` bracket one job execution.
pub trait Store {
    /// The materialized output directory for `id`, if present.
    fn lookup(&self, id: &Id) -> Option<PathBuf>;

    fn contains(&self, id: &Id) -> bool {
        self.lookup(id).is_some()
    }

    /// A fresh, empty directory to run a job into.
    fn begin(&self, id: &Id) -> Result<Staging, StoreError>;

    /// Atomically publish a staged directory, returning the final path.
    /// Publishing an id that is already present keeps the existing entry:
    /// equal ids mean equal content.
    fn commit(&self, staging: Staging) -> Result<PathBuf, StoreError>;
}

/// Store backed by a local directory tree.
pub struct FsStore {
    root: PathBuf,
    tmp: PathBuf,
    /// Ids confirmed present on disk, so repeat lookups skip the stat.
    /// Shared across threads; the filesystem remains the source of truth.
    known: DashMap<Id, PathBuf>,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory tree if
    /// needed.
    pub fn open(root: impl AsRef<Path>) -> Result<FsStore, StoreError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|source| StoreError::Open {
            path: root.to_path_buf(),
            source,
        })?;
        let root = fs::canonicalize(root).map_err(|source| StoreError::Open {
            path: root.to_path_buf(),
            source,
        })?;
        let tmp = root.join("tmp");
        fs::create_dir_all(&tmp).map_err(|source| StoreError::Open {
            path: tmp.clone(),
            source,
        })?;
        log::debug!("opened store at {:?}", root);
        Ok(FsStore {
            root,
            tmp,
            known: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Store for FsStore {
    fn lookup(&self, id: &Id) -> Option<PathBuf> {
        if let Some(path) = self.known.get(id) {
            return Some(path.clone());
        }
        let path = self.root.join(id.storage_path());
        if path.is_dir() {
            self.known.insert(*id, path.clone());
            Some(path)
        } else {
            None
        }
    }

    fn begin(&self, id: &Id) -> Result<Staging, StoreError> {
        let hex = id.to_string();
        let dir = tempfile::Builder::new()
            .prefix(&format!("{}.", &hex[..8]))
            .tempdir_in(&self.tmp)
            .map_err(|source| StoreError::Stage { id: *id, source })?;
        Ok(Staging { id: *id, dir })
    }

    fn commit(&self, staging: Staging) -> Result<PathBuf, StoreError> {
        let id = staging.id;
        let path = self.root.join(id.storage_path());
        if let Some(shard) = path.parent() {
            fs::create_dir_all(shard).map_err(|source| StoreError::Publish { id, source })?;
        }
        let staged = staging.dir.into_path();
        match fs::rename(&staged, &path) {
            Ok(()) => {}
            Err(source) => {
                // The staged copy is dead either way.  When the rename lost
                // a race to another writer publishing the same id, the
                // winner's directory is as good as ours.
                let _ = fs::remove_dir_all(&staged);
                if !path.is_dir() {
                    return Err(StoreError::Publish { id, source });
                }
            }
        }
        log::debug!("published {}", id);
        self.known.insert(id, path.clone());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash;

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(dir.path().join("store")).unwrap();
        (dir, store)
    }

    fn tmp_entries(store: &FsStore) -> usize {
        fs::read_dir(store.root().join("tmp")).unwrap().count()
    }

    #[test]
    fn commit_then_lookup() {
        let (_dir, store) = store();
        let id = hash::hash_file(b"work");
        assert_eq!(store.lookup(&id), None);
        assert!(!store.contains(&id));

        let staging = store.begin(&id).unwrap();
        fs::write(staging.path().join("result.txt"), "done").unwrap();
        let path = store.commit(staging).unwrap();

        assert_eq!(store.lookup(&id), Some(path.clone()));
        assert!(store.contains(&id));
        assert_eq!(fs::read_to_string(path.join("result.txt")).unwrap(), "done");
    }

    #[test]
    fn layout_is_sharded_by_first_byte() {
        let (_dir, store) = store();
        let id = hash::hash_file(b"sharded");
        let staging = store.begin(&id).unwrap();
        let path = store.commit(staging).unwrap();

        let hex = id.to_string();
        assert_eq!(path, store.root().join(&hex[..2]).join(&hex));
        assert!(path.is_dir());
    }

    #[test]
    fn duplicate_commit_keeps_first_publish() {
        let (_dir, store) = store();
        let id = hash::hash_file(b"twice");

        let first = store.begin(&id).unwrap();
        fs::write(first.path().join("who.txt"), "first").unwrap();
        let path = store.commit(first).unwrap();

        let second = store.begin(&id).unwrap();
        fs::write(second.path().join("who.txt"), "second").unwrap();
        let again = store.commit(second).unwrap();

        assert_eq!(path, again);
        assert_eq!(fs::read_to_string(path.join("who.txt")).unwrap(), "first");
        // The losing staging directory is gone.
        assert_eq!(tmp_entries(&store), 0);
    }

    #[test]
    fn failed_publish_discards_staging() {
        let (_dir, store) = store();
        let id = hash::hash_file(b"squatter");
        // A regular file squatting on the final path makes the rename fail.
        let path = store.root().join(id.storage_path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "in the way").unwrap();

        let staging = store.begin(&id).unwrap();
        fs::write(staging.path().join("out"), "data").unwrap();
        let err = store.commit(staging).unwrap_err();
        assert!(matches!(err, StoreError::Publish { .. }));
        // The squatter survives and the staging directory does not.
        assert_eq!(fs::read_to_string(&path).unwrap(), "in the way");
        assert_eq!(tmp_entries(&store), 0);
    }

    #[test]
    fn dropped_staging_is_removed() {
        let (_dir, store) = store();
        let id = hash::hash_file(b"abandoned");
        let staging = store.begin(&id).unwrap();
        fs::write(staging.path().join("partial"), "junk").unwrap();
        assert_eq!(tmp_entries(&store), 1);
        drop(staging);
        assert_eq!(tmp_entries(&store), 0);
        assert!(!store.contains(&id));
    }

    #[test]
    fn lookup_stats_disk_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = hash::hash_file(b"persistent");
        {
            let store = FsStore::open(dir.path().join("store")).unwrap();
            let staging = store.begin(&id).unwrap();
            fs::write(staging.path().join("keep"), "kept").unwrap();
            store.commit(staging).unwrap();
        }
        let store = FsStore::open(dir.path().join("store")).unwrap();
        let path = store.lookup(&id).expect("entry survives reopen");
        assert_eq!(fs::read_to_string(path.join("keep")).unwrap(), "kept");
    }
}
