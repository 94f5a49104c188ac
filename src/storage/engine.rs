// RocksDB-backed engine.
//
// Reads run against a RocksDB snapshot so they always see one
// point in time and never wait on the writer. Writes are staged in a
// WriteBatch and committed only when the update closure returns Ok.
// Every commit is fsynced before `update` returns: the log, the vote
// and the applied marker are all acknowledged on that basis.
//
// Lock order: log_bounds, then writer.

use std::path::Path;

use parking_lot::Mutex;
use rocksdb::{Direction, IteratorMode, Options, Snapshot, WriteBatch, WriteOptions, DB};
use tracing::debug;

use super::kv::{Command, Operation};
use super::store::{
    decode_record, encode_record, log_index, KeyValueStore, KeyspaceSnapshot, LogRecord, LogStore,
    Namespace, StableStore, APPLIED_FIELD,
};
use crate::error::StorageError;

#[derive(Debug, Default, Clone, Copy)]
struct LogBounds {
    first: Option<u64>,
    last: Option<u64>,
}

pub struct Engine {
    db: DB,
    sync_writes: bool,
    writer: Mutex<()>,
    log_bounds: Mutex<LogBounds>,
}

pub struct ReadTxn<'a> {
    snapshot: Snapshot<'a>,
}

pub struct WriteTxn<'a> {
    snapshot: Snapshot<'a>,
    batch: WriteBatch,
}

impl Engine {
    pub fn open(path: impl AsRef<Path>) -> Result<Engine, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())?;

        let engine = Engine {
            db,
            sync_writes: true,
            writer: Mutex::new(()),
            log_bounds: Mutex::new(LogBounds::default()),
        };
        let bounds = engine.view(|txn| {
            Ok(LogBounds {
                first: txn.first_key(Namespace::Log)?.map(|k| log_index(&k)).transpose()?,
                last: txn.last_key(Namespace::Log)?.map(|k| log_index(&k)).transpose()?,
            })
        })?;
        *engine.log_bounds.lock() = bounds;
        debug!(
            path = %path.as_ref().display(),
            first = ?bounds.first,
            last = ?bounds.last,
            "engine opened"
        );
        Ok(engine)
    }

    pub fn view<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&ReadTxn<'_>) -> Result<T, StorageError>,
    {
        let txn = ReadTxn {
            snapshot: self.db.snapshot(),
        };
        f(&txn)
    }

    /// Runs `f` under the writer lock. The batch is written only if `f`
    /// returns Ok; on Err it is dropped and nothing reaches disk.
    pub fn update<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T, StorageError>,
    {
        let _guard = self.writer.lock();
        let mut txn = WriteTxn {
            snapshot: self.db.snapshot(),
            batch: WriteBatch::default(),
        };
        let out = f(&mut txn)?;
        let WriteTxn { batch, .. } = txn;
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(out)
    }

    pub fn syncs_writes(&self) -> bool {
        self.sync_writes
    }
}

impl<'a> ReadTxn<'a> {
    pub fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.snapshot.get(ns.key(key))?)
    }

    /// Visits keys of `ns` from `start` upwards until `f` returns false.
    pub fn for_each_from<F>(
        &self,
        ns: Namespace,
        start: &[u8],
        mut f: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, StorageError>,
    {
        let from = ns.key(start);
        let iter = self
            .snapshot
            .iterator(IteratorMode::From(from.as_slice(), Direction::Forward));
        for item in iter {
            let (k, v) = item?;
            if k.first() != Some(&ns.prefix()) {
                break;
            }
            if !f(&k[1..], &v)? {
                break;
            }
        }
        Ok(())
    }

    pub fn scan(&self, ns: Namespace) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StorageError> {
        let mut out = Vec::new();
        self.for_each_from(ns, &[], |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(true)
        })?;
        Ok(out)
    }

    pub fn first_key(&self, ns: Namespace) -> Result<Option<Vec<u8>>, StorageError> {
        let mut first = None;
        self.for_each_from(ns, &[], |k, _| {
            first = Some(k.to_vec());
            Ok(false)
        })?;
        Ok(first)
    }

    pub fn last_key(&self, ns: Namespace) -> Result<Option<Vec<u8>>, StorageError> {
        let end = ns.end();
        let iter = self
            .snapshot
            .iterator(IteratorMode::From(end.as_slice(), Direction::Reverse));
        for item in iter {
            let (k, _) = item?;
            match k.first() {
                Some(p) if *p == ns.prefix() => return Ok(Some(k[1..].to_vec())),
                // seek_for_prev can land on the next namespace's bare prefix
                Some(p) if *p > ns.prefix() => continue,
                _ => break,
            }
        }
        Ok(None)
    }
}

impl<'a> WriteTxn<'a> {
    /// Reads the state as of the start of the transaction.
    pub fn get(&self, ns: Namespace, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.snapshot.get(ns.key(key))?)
    }

    pub fn put(&mut self, ns: Namespace, key: &[u8], value: &[u8]) {
        self.batch.put(ns.key(key), value);
    }

    pub fn delete(&mut self, ns: Namespace, key: &[u8]) {
        self.batch.delete(ns.key(key));
    }

    pub fn delete_range(&mut self, from: Vec<u8>, to: Vec<u8>) {
        self.batch.delete_range(from, to);
    }

    pub fn clear(&mut self, ns: Namespace) {
        self.batch.delete_range(ns.key(&[]), ns.end());
    }
}

impl StableStore for Engine {
    fn get_bytes(&self, name: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.view(|txn| txn.get(Namespace::Stable, name))?
            .ok_or(StorageError::KeyNotFound)
    }

    fn set_bytes(&self, name: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.update(|txn| {
            txn.put(Namespace::Stable, name, value);
            Ok(())
        })
    }
}

impl LogStore for Engine {
    fn first_index(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.log_bounds.lock().first)
    }

    fn last_index(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.log_bounds.lock().last)
    }

    fn get_log(&self, index: u64) -> Result<LogRecord, StorageError> {
        let raw = self
            .view(|txn| txn.get(Namespace::Log, &index.to_be_bytes()))?
            .ok_or(StorageError::KeyNotFound)?;
        decode_record(&raw)
    }

    fn get_logs(&self, from: u64, to: u64) -> Result<Vec<LogRecord>, StorageError> {
        let mut out = Vec::new();
        if from > to {
            return Ok(out);
        }
        self.view(|txn| {
            txn.for_each_from(Namespace::Log, &from.to_be_bytes(), |k, v| {
                if log_index(k)? > to {
                    return Ok(false);
                }
                out.push(decode_record(v)?);
                Ok(true)
            })
        })?;
        Ok(out)
    }

    fn store_logs(&self, logs: &[LogRecord]) -> Result<(), StorageError> {
        if logs.is_empty() {
            return Ok(());
        }
        let mut bounds = self.log_bounds.lock();
        self.update(|txn| {
            for record in logs {
                txn.put(
                    Namespace::Log,
                    &record.index.to_be_bytes(),
                    &encode_record(record)?,
                );
            }
            Ok(())
        })?;

        for record in logs {
            bounds.first = Some(bounds.first.map_or(record.index, |f| f.min(record.index)));
            bounds.last = Some(bounds.last.map_or(record.index, |l| l.max(record.index)));
        }
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<(), StorageError> {
        if min > max {
            return Ok(());
        }
        let mut bounds = self.log_bounds.lock();
        let to = match max.checked_add(1) {
            Some(end) => Namespace::log_key(end),
            None => Namespace::Log.end(),
        };
        self.update(|txn| {
            txn.delete_range(Namespace::log_key(min), to);
            Ok(())
        })?;

        let (first, last) = match (bounds.first, bounds.last) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(()),
        };
        if max < first || min > last {
            return Ok(());
        }
        // Only the touched edge moves; a seek finds the new one.
        *bounds = self.view(|txn| {
            Ok(LogBounds {
                first: if min <= first {
                    txn.first_key(Namespace::Log)?.map(|k| log_index(&k)).transpose()?
                } else {
                    Some(first)
                },
                last: if max >= last {
                    txn.last_key(Namespace::Log)?.map(|k| log_index(&k)).transpose()?
                } else {
                    Some(last)
                },
            })
        })?;
        Ok(())
    }
}

impl KeyValueStore for Engine {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.view(|txn| txn.get(Namespace::User, key))?
            .ok_or(StorageError::KeyNotFound)
    }

    fn apply(&self, command: Option<&Command>, applied: &[u8]) -> Result<(), StorageError> {
        self.update(|txn| {
            if let Some(cmd) = command {
                match cmd.operation {
                    Operation::Set => txn.put(Namespace::User, &cmd.key, &cmd.value),
                    Operation::Delete => txn.delete(Namespace::User, &cmd.key),
                }
            }
            txn.put(Namespace::Stable, APPLIED_FIELD, applied);
            Ok(())
        })
    }

    fn applied_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        self.view(|txn| txn.get(Namespace::Stable, APPLIED_FIELD))
    }

    fn snapshot(&self) -> Result<KeyspaceSnapshot, StorageError> {
        self.view(|txn| {
            Ok(KeyspaceSnapshot {
                applied: txn.get(Namespace::Stable, APPLIED_FIELD)?,
                pairs: txn.scan(Namespace::User)?,
            })
        })
    }

    fn restore(&self, pairs: &[(Vec<u8>, Vec<u8>)], applied: &[u8]) -> Result<(), StorageError> {
        self.update(|txn| {
            txn.clear(Namespace::User);
            for (k, v) in pairs {
                txn.put(Namespace::User, k, v);
            }
            txn.put(Namespace::Stable, APPLIED_FIELD, applied);
            Ok(())
        })
    }
}
