// File snapshot store.
//
// snapshots/
//   00000000000000000002-00000000000000000150-1718000000000/
//     meta.json
//     state.bin
//
// Directory names sort by term, then index, then creation time, so
// the lexically greatest entry is the newest snapshot. A snapshot is
// written under a `.tmp` name and renamed into place once complete.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;

const META_FILE: &str = "meta.json";
const STATE_FILE: &str = "state.bin";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug)]
pub struct SnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, retain: usize) -> Result<SnapshotStore, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        // leftovers from a crash mid-save
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                fs::remove_dir_all(&path)?;
            }
        }

        Ok(SnapshotStore {
            dir,
            retain: retain.max(1),
        })
    }

    pub fn save<M: Serialize>(
        &self,
        term: u64,
        index: u64,
        meta: &M,
        data: &[u8],
    ) -> Result<PathBuf, StorageError> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let name = format!("{term:020}-{index:020}-{millis}");
        let tmp = self.dir.join(format!("{name}{TMP_SUFFIX}"));
        let path = self.dir.join(&name);

        fs::create_dir_all(&tmp)?;
        write_synced(&tmp.join(STATE_FILE), data)?;
        write_synced(&tmp.join(META_FILE), &serde_json::to_vec_pretty(meta)?)?;
        sync_dir(&tmp)?;
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir)?;
        debug!(snapshot = %name, size = data.len(), "snapshot saved");

        self.prune()?;
        Ok(path)
    }

    /// The newest complete snapshot, if any.
    pub fn latest<M: DeserializeOwned>(&self) -> Result<Option<(M, Vec<u8>)>, StorageError> {
        for path in self.list()?.into_iter().rev() {
            match read_snapshot(&path) {
                Ok(snapshot) => return Ok(Some(snapshot)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable snapshot"),
            }
        }
        Ok(None)
    }

    /// Completed snapshot directories, oldest first.
    pub fn list(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if entry.file_type()?.is_dir() && !name.to_string_lossy().ends_with(TMP_SUFFIX) {
                out.push(entry.path());
            }
        }
        out.sort();
        Ok(out)
    }

    fn prune(&self) -> Result<(), StorageError> {
        let all = self.list()?;
        if all.len() <= self.retain {
            return Ok(());
        }
        for path in &all[..all.len() - self.retain] {
            debug!(path = %path.display(), "removing old snapshot");
            fs::remove_dir_all(path)?;
        }
        Ok(())
    }
}

fn write_synced(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

// Makes renames and new entries in `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StorageError> {
    Ok(())
}

fn read_snapshot<M: DeserializeOwned>(path: &Path) -> Result<(M, Vec<u8>), StorageError> {
    let meta = serde_json::from_slice(&fs::read(path.join(META_FILE))?)?;
    let data = fs::read(path.join(STATE_FILE))?;
    Ok((meta, data))
}
