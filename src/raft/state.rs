// Persistent raft state: the replicated log plus the vote, committed
// and purged markers, all kept in the node's engine.
//
// Log records hold the encoded openraft entry; the vote and markers
// live as stable fields next to the node id.

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use openraft::storage::{LogFlushed, RaftLogStorage};
use openraft::{LogState, OptionalSend, RaftLogReader, StorageIOError};
use tracing::debug;

use super::types::{Entry, LogId, RaftStorageError, TypeConfig, Vote};
use crate::error::StorageError;
use crate::storage::store::{LogRecord, LogStore, StableStore};
use crate::utils::codec;

const VOTE_FIELD: &[u8] = b"vote";
const COMMITTED_FIELD: &[u8] = b"committed";
const LAST_PURGED_FIELD: &[u8] = b"last_purged";

pub struct LogStorage<S> {
    store: Arc<S>,
}

impl<S> Clone for LogStorage<S> {
    fn clone(&self) -> Self {
        LogStorage {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: LogStore + StableStore> LogStorage<S> {
    pub fn new(store: Arc<S>) -> LogStorage<S> {
        LogStorage { store }
    }

    fn read_field<T: serde::de::DeserializeOwned>(
        &self,
        name: &[u8],
    ) -> Result<Option<T>, StorageError> {
        match self.store.get_bytes(name) {
            Ok(raw) => Ok(Some(codec::decode(&raw)?)),
            Err(StorageError::KeyNotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write_field<T: serde::Serialize>(&self, name: &[u8], value: &T) -> Result<(), StorageError> {
        self.store.set_bytes(name, &codec::encode(value)?)
    }

    fn last_log_id(&self) -> Result<Option<LogId>, StorageError> {
        match self.store.last_index()? {
            Some(index) => {
                let record = self.store.get_log(index)?;
                let entry: Entry = codec::decode(&record.payload)?;
                Ok(Some(entry.log_id))
            }
            None => Ok(None),
        }
    }

    fn entries(&self, from: u64, to: u64) -> Result<Vec<Entry>, StorageError> {
        self.store
            .get_logs(from, to)?
            .into_iter()
            .map(|record| Ok(codec::decode(&record.payload)?))
            .collect()
    }
}

fn to_record(entry: &Entry) -> Result<LogRecord, StorageError> {
    Ok(LogRecord {
        index: entry.log_id.index,
        term: entry.log_id.leader_id.term,
        payload: codec::encode(entry)?,
    })
}

impl<S: LogStore + StableStore> RaftLogReader<TypeConfig> for LogStorage<S> {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry>, RaftStorageError> {
        let from = match range.start_bound() {
            Bound::Included(i) => *i,
            Bound::Excluded(i) => i.saturating_add(1),
            Bound::Unbounded => 0,
        };
        let to = match range.end_bound() {
            Bound::Included(i) => *i,
            Bound::Excluded(0) => return Ok(Vec::new()),
            Bound::Excluded(i) => *i - 1,
            Bound::Unbounded => u64::MAX,
        };
        self.entries(from, to)
            .map_err(|e| StorageIOError::read_logs(&e).into())
    }
}

impl<S: LogStore + StableStore> RaftLogStorage<TypeConfig> for LogStorage<S> {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, RaftStorageError> {
        let last_purged_log_id = self
            .read_field::<Option<LogId>>(LAST_PURGED_FIELD)
            .map_err(|e| StorageIOError::read_logs(&e))?
            .flatten();
        let last_log_id = self
            .last_log_id()
            .map_err(|e| StorageIOError::read_logs(&e))?
            .or(last_purged_log_id);

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote) -> Result<(), RaftStorageError> {
        self.write_field(VOTE_FIELD, vote)
            .map_err(|e| StorageIOError::write_vote(&e))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote>, RaftStorageError> {
        Ok(self
            .read_field(VOTE_FIELD)
            .map_err(|e| StorageIOError::read_vote(&e))?)
    }

    async fn save_committed(&mut self, committed: Option<LogId>) -> Result<(), RaftStorageError> {
        self.write_field(COMMITTED_FIELD, &committed)
            .map_err(|e| StorageIOError::write(&e))?;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId>, RaftStorageError> {
        Ok(self
            .read_field::<Option<LogId>>(COMMITTED_FIELD)
            .map_err(|e| StorageIOError::read(&e))?
            .flatten())
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), RaftStorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let records = entries
            .into_iter()
            .map(|entry| to_record(&entry))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StorageIOError::write_logs(&e))?;

        self.store
            .store_logs(&records)
            .map_err(|e| StorageIOError::write_logs(&e))?;

        // store_logs returns once the batch is fsynced
        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), RaftStorageError> {
        debug!(%log_id, "truncating log");
        self.store
            .delete_range(log_id.index, u64::MAX)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), RaftStorageError> {
        debug!(%log_id, "purging log");
        self.write_field(LAST_PURGED_FIELD, &Some(log_id))
            .map_err(|e| StorageIOError::write(&e))?;
        self.store
            .delete_range(0, log_id.index)
            .map_err(|e| StorageIOError::write_logs(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemKV;
    use openraft::{CommittedLeaderId, EntryPayload};

    fn log_id(term: u64, index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(term, 1), index)
    }

    fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<Entry> {
        range
            .map(|i| Entry {
                log_id: log_id(term, i),
                payload: EntryPayload::Normal(format!("cmd-{i}").into_bytes()),
            })
            .collect()
    }

    fn storage() -> LogStorage<MemKV> {
        LogStorage::new(Arc::new(MemKV::new()))
    }

    // Writes directly, bypassing the flush callback.
    fn append(storage: &LogStorage<MemKV>, entries: &[Entry]) {
        let records: Vec<_> = entries.iter().map(|e| to_record(e).unwrap()).collect();
        storage.store.store_logs(&records).unwrap();
    }

    #[tokio::test]
    async fn vote_and_committed_persist() {
        let mut storage = storage();
        assert_eq!(storage.read_vote().await.unwrap(), None);
        assert_eq!(storage.read_committed().await.unwrap(), None);

        let vote = Vote::new(3, 42);
        storage.save_vote(&vote).await.unwrap();
        storage.save_committed(Some(log_id(3, 9))).await.unwrap();

        let mut reopened = LogStorage::new(Arc::clone(&storage.store));
        assert_eq!(reopened.read_vote().await.unwrap(), Some(vote));
        assert_eq!(reopened.read_committed().await.unwrap(), Some(log_id(3, 9)));
    }

    #[tokio::test]
    async fn read_ranges() {
        let mut storage = storage();
        append(&storage, &entries(1, 0..=9));

        assert_eq!(storage.try_get_log_entries(2..5).await.unwrap().len(), 3);
        assert_eq!(storage.try_get_log_entries(2..=5).await.unwrap().len(), 4);
        assert_eq!(storage.try_get_log_entries(..).await.unwrap().len(), 10);
        assert!(storage.try_get_log_entries(0..0).await.unwrap().is_empty());

        let got = storage.try_get_log_entries(7..).await.unwrap();
        assert_eq!(got.first().map(|e| e.log_id), Some(log_id(1, 7)));
    }

    #[tokio::test]
    async fn truncate_and_purge_move_the_log_state() {
        let mut storage = storage();
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, None);
        assert_eq!(state.last_purged_log_id, None);

        append(&storage, &entries(1, 1..=10));
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 10)));

        storage.truncate(log_id(1, 8)).await.unwrap();
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 7)));

        storage.purge(log_id(1, 4)).await.unwrap();
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(log_id(1, 4)));
        assert_eq!(state.last_log_id, Some(log_id(1, 7)));
        assert_eq!(storage.try_get_log_entries(..).await.unwrap().len(), 3);

        // purging everything falls back to the purged id
        storage.purge(log_id(1, 7)).await.unwrap();
        let state = storage.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id, Some(log_id(1, 7)));
        assert!(storage.try_get_log_entries(..).await.unwrap().is_empty());
    }
}
