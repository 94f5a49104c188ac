// Capability traits the consensus adapters are written against,
// plus an in-memory implementation of all three.
//
// Every key lives in one of three namespaces, distinguished by a
// single prefix byte, so user keys can never shadow raft state.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::kv::{Command, Operation};
use crate::error::StorageError;

/// Stable field holding the state machine's applied marker.
pub const APPLIED_FIELD: &[u8] = b"fsm_applied";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Log,
    Stable,
    User,
}

impl Namespace {
    pub fn prefix(self) -> u8 {
        match self {
            Namespace::Log => b'l',
            Namespace::Stable => b'm',
            Namespace::User => b'u',
        }
    }

    pub fn key(self, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(key.len() + 1);
        out.push(self.prefix());
        out.extend_from_slice(key);
        out
    }

    pub fn log_key(index: u64) -> Vec<u8> {
        Namespace::Log.key(&index.to_be_bytes())
    }

    /// Exclusive upper bound of the namespace.
    pub fn end(self) -> Vec<u8> {
        vec![self.prefix() + 1]
    }
}

pub fn log_index(key: &[u8]) -> Result<u64, StorageError> {
    let raw: [u8; 8] = key
        .try_into()
        .map_err(|_| StorageError::Corrupt(format!("log key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(raw))
}

/// A persisted log entry. `payload` is the encoded consensus entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub index: u64,
    pub term: u64,
    pub payload: Vec<u8>,
}

/// Point-in-time copy of the user keyspace, ascending by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyspaceSnapshot {
    pub applied: Option<Vec<u8>>,
    pub pairs: Vec<(Vec<u8>, Vec<u8>)>,
}

pub trait StableStore: Send + Sync + 'static {
    fn get_bytes(&self, name: &[u8]) -> Result<Vec<u8>, StorageError>;
    fn set_bytes(&self, name: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn get_u64(&self, name: &[u8]) -> Result<u64, StorageError> {
        let raw = self.get_bytes(name)?;
        rmp::decode::read_u64(&mut raw.as_slice())
            .map_err(|e| StorageError::Corrupt(format!("u64 field: {e}")))
    }

    fn set_u64(&self, name: &[u8], value: u64) -> Result<(), StorageError> {
        let mut buf = Vec::with_capacity(9);
        rmp::encode::write_u64(&mut buf, value)
            .map_err(|e| StorageError::Corrupt(format!("u64 field: {e}")))?;
        self.set_bytes(name, &buf)
    }
}

pub trait LogStore: Send + Sync + 'static {
    fn first_index(&self) -> Result<Option<u64>, StorageError>;
    fn last_index(&self) -> Result<Option<u64>, StorageError>;
    fn get_log(&self, index: u64) -> Result<LogRecord, StorageError>;
    /// Inclusive on both ends.
    fn get_logs(&self, from: u64, to: u64) -> Result<Vec<LogRecord>, StorageError>;
    fn store_logs(&self, logs: &[LogRecord]) -> Result<(), StorageError>;
    /// Inclusive on both ends.
    fn delete_range(&self, min: u64, max: u64) -> Result<(), StorageError>;
}

pub trait KeyValueStore: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Applies one log entry: the mutation (if any) and the new applied
    /// marker land in the same write.
    fn apply(&self, command: Option<&Command>, applied: &[u8]) -> Result<(), StorageError>;

    fn applied_state(&self) -> Result<Option<Vec<u8>>, StorageError>;

    fn snapshot(&self) -> Result<KeyspaceSnapshot, StorageError>;

    /// Replaces the whole user keyspace.
    fn restore(&self, pairs: &[(Vec<u8>, Vec<u8>)], applied: &[u8]) -> Result<(), StorageError>;
}

pub(crate) fn encode_record(record: &LogRecord) -> Result<Vec<u8>, StorageError> {
    Ok(crate::utils::codec::encode(record)?)
}

pub(crate) fn decode_record(bytes: &[u8]) -> Result<LogRecord, StorageError> {
    Ok(crate::utils::codec::decode(bytes)?)
}

/// In-memory engine. Nothing survives a drop.
#[derive(Debug, Default)]
pub struct MemKV {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemKV {
    pub fn new() -> MemKV {
        MemKV::default()
    }

    fn log_bound(&self, first: bool) -> Option<u64> {
        let data = self.data.read();
        let mut range = data.range(Namespace::Log.key(&[])..Namespace::Log.end());
        let entry = if first { range.next() } else { range.next_back() };
        entry.and_then(|(k, _)| log_index(&k[1..]).ok())
    }

    fn user_pairs(data: &BTreeMap<Vec<u8>, Vec<u8>>) -> Vec<(Vec<u8>, Vec<u8>)> {
        data.range(Namespace::User.key(&[])..Namespace::User.end())
            .map(|(k, v)| (k[1..].to_vec(), v.clone()))
            .collect()
    }
}

impl StableStore for MemKV {
    fn get_bytes(&self, name: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.data
            .read()
            .get(&Namespace::Stable.key(name))
            .cloned()
            .ok_or(StorageError::KeyNotFound)
    }

    fn set_bytes(&self, name: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .insert(Namespace::Stable.key(name), value.to_vec());
        Ok(())
    }
}

impl LogStore for MemKV {
    fn first_index(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.log_bound(true))
    }

    fn last_index(&self) -> Result<Option<u64>, StorageError> {
        Ok(self.log_bound(false))
    }

    fn get_log(&self, index: u64) -> Result<LogRecord, StorageError> {
        let data = self.data.read();
        let raw = data
            .get(&Namespace::log_key(index))
            .ok_or(StorageError::KeyNotFound)?;
        decode_record(raw)
    }

    fn get_logs(&self, from: u64, to: u64) -> Result<Vec<LogRecord>, StorageError> {
        if from > to {
            return Ok(Vec::new());
        }
        let data = self.data.read();
        data.range((
            Bound::Included(Namespace::log_key(from)),
            Bound::Included(Namespace::log_key(to)),
        ))
        .map(|(_, v)| decode_record(v))
        .collect()
    }

    fn store_logs(&self, logs: &[LogRecord]) -> Result<(), StorageError> {
        let encoded = logs
            .iter()
            .map(|r| Ok((Namespace::log_key(r.index), encode_record(r)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        self.data.write().extend(encoded);
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<(), StorageError> {
        if min > max {
            return Ok(());
        }
        let mut data = self.data.write();
        let doomed: Vec<Vec<u8>> = data
            .range((
                Bound::Included(Namespace::log_key(min)),
                Bound::Included(Namespace::log_key(max)),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            data.remove(&key);
        }
        Ok(())
    }
}

impl KeyValueStore for MemKV {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.data
            .read()
            .get(&Namespace::User.key(key))
            .cloned()
            .ok_or(StorageError::KeyNotFound)
    }

    fn apply(&self, command: Option<&Command>, applied: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write();
        if let Some(cmd) = command {
            match cmd.operation {
                Operation::Set => {
                    data.insert(Namespace::User.key(&cmd.key), cmd.value.clone());
                }
                Operation::Delete => {
                    data.remove(&Namespace::User.key(&cmd.key));
                }
            }
        }
        data.insert(Namespace::Stable.key(APPLIED_FIELD), applied.to_vec());
        Ok(())
    }

    fn applied_state(&self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self
            .data
            .read()
            .get(&Namespace::Stable.key(APPLIED_FIELD))
            .cloned())
    }

    fn snapshot(&self) -> Result<KeyspaceSnapshot, StorageError> {
        let data = self.data.read();
        Ok(KeyspaceSnapshot {
            applied: data.get(&Namespace::Stable.key(APPLIED_FIELD)).cloned(),
            pairs: MemKV::user_pairs(&data),
        })
    }

    fn restore(&self, pairs: &[(Vec<u8>, Vec<u8>)], applied: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write();
        data.retain(|k, _| k.first() != Some(&Namespace::User.prefix()));
        for (k, v) in pairs {
            data.insert(Namespace::User.key(k), v.clone());
        }
        data.insert(Namespace::Stable.key(APPLIED_FIELD), applied.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: u64) -> LogRecord {
        LogRecord {
            index,
            term: 1,
            payload: vec![index as u8],
        }
    }

    #[test]
    fn stable_fields() {
        let kv = MemKV::new();
        assert!(matches!(kv.get_u64(b"node_id"), Err(StorageError::KeyNotFound)));
        kv.set_u64(b"node_id", u64::MAX - 3).unwrap();
        assert_eq!(kv.get_u64(b"node_id").unwrap(), u64::MAX - 3);

        kv.set_bytes(b"junk", b"not-msgpack").unwrap();
        assert!(matches!(kv.get_u64(b"junk"), Err(StorageError::Corrupt(_))));
    }

    #[test]
    fn log_bounds_and_ranges() {
        let kv = MemKV::new();
        assert_eq!(kv.first_index().unwrap(), None);

        let logs: Vec<_> = (1..=10).map(record).collect();
        kv.store_logs(&logs).unwrap();
        assert_eq!(kv.first_index().unwrap(), Some(1));
        assert_eq!(kv.last_index().unwrap(), Some(10));
        assert_eq!(kv.get_logs(3, 5).unwrap(), logs[2..5].to_vec());

        kv.delete_range(1, 4).unwrap();
        assert_eq!(kv.first_index().unwrap(), Some(5));
        assert!(matches!(kv.get_log(4), Err(StorageError::KeyNotFound)));

        kv.delete_range(8, u64::MAX).unwrap();
        assert_eq!(kv.last_index().unwrap(), Some(7));
    }

    #[test]
    fn namespaces_do_not_collide() {
        let kv = MemKV::new();
        kv.store_logs(&[record(0)]).unwrap();
        kv.set_bytes(b"vote", b"v").unwrap();
        kv.apply(Some(&Command::set(b"vote", b"user")), b"marker")
            .unwrap();

        assert_eq!(kv.get(b"vote").unwrap(), b"user");
        assert_eq!(kv.get_bytes(b"vote").unwrap(), b"v");
        assert_eq!(kv.snapshot().unwrap().pairs.len(), 1);

        kv.restore(&[], b"marker2").unwrap();
        assert!(matches!(kv.get(b"vote"), Err(StorageError::KeyNotFound)));
        assert_eq!(kv.get_bytes(b"vote").unwrap(), b"v");
        assert_eq!(kv.last_index().unwrap(), Some(0));
    }
}
