// SM -> the state machine replicated across the nodes.
//
// Committed entries arrive here strictly in log order. Each entry
// becomes one engine write holding both the mutation and the new
// applied marker, so after a crash the node resumes right after the
// last entry it applied and never applies one twice.

use std::io::Cursor;
use std::sync::Arc;

use openraft::storage::RaftStateMachine;
use openraft::{EntryPayload, OptionalSend, RaftSnapshotBuilder, StorageIOError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::types::{
    CommandResponse, Entry, LogId, RaftStorageError, Snapshot, SnapshotMeta, StoredMembership,
    TypeConfig,
};
use crate::error::StorageError;
use crate::storage::kv::Command;
use crate::storage::snapshot::SnapshotStore;
use crate::storage::store::KeyValueStore;
use crate::utils::codec;

/// Persisted alongside every applied entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedState {
    pub last_applied: Option<LogId>,
    pub last_membership: StoredMembership,
}

pub struct StateMachineStore<S> {
    store: Arc<S>,
    snapshots: Arc<SnapshotStore>,
    applied: AppliedState,
}

impl<S> Clone for StateMachineStore<S> {
    fn clone(&self) -> Self {
        StateMachineStore {
            store: Arc::clone(&self.store),
            snapshots: Arc::clone(&self.snapshots),
            applied: self.applied.clone(),
        }
    }
}

impl<S: KeyValueStore> StateMachineStore<S> {
    pub fn new(store: Arc<S>, snapshots: Arc<SnapshotStore>) -> Result<Self, StorageError> {
        let applied = match store.applied_state()? {
            Some(raw) => codec::decode(&raw)?,
            None => AppliedState::default(),
        };
        debug!(last_applied = ?applied.last_applied, "state machine loaded");
        Ok(StateMachineStore {
            store,
            snapshots,
            applied,
        })
    }

    fn apply_entry(&mut self, entry: Entry) -> Result<CommandResponse, StorageError> {
        let log_id = entry.log_id;
        let mut next = self.applied.clone();
        next.last_applied = Some(log_id);

        let command = match entry.payload {
            EntryPayload::Blank => None,
            EntryPayload::Normal(payload) => Some(Command::decode(&payload)?),
            EntryPayload::Membership(membership) => {
                next.last_membership = StoredMembership::new(Some(log_id), membership);
                None
            }
        };

        self.store.apply(command.as_ref(), &codec::encode(&next)?)?;
        self.applied = next;
        Ok(CommandResponse {
            index: log_id.index,
        })
    }

    fn snapshot_bytes(&self) -> Result<(AppliedState, Vec<u8>), StorageError> {
        let view = self.store.snapshot()?;
        let applied = match view.applied {
            Some(raw) => codec::decode(&raw)?,
            None => AppliedState::default(),
        };
        Ok((applied, codec::encode(&view.pairs)?))
    }

    fn persist(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), StorageError> {
        let (term, index) = meta
            .last_log_id
            .map(|id| (id.leader_id.term, id.index))
            .unwrap_or_default();
        self.snapshots.save(term, index, meta, data)?;
        Ok(())
    }
}

impl<S: KeyValueStore> RaftSnapshotBuilder<TypeConfig> for StateMachineStore<S> {
    async fn build_snapshot(&mut self) -> Result<Snapshot, RaftStorageError> {
        // One read view: the marker and the pairs describe the same prefix.
        let (applied, data) = self
            .snapshot_bytes()
            .map_err(|e| StorageIOError::read_state_machine(&e))?;

        let snapshot_id = match applied.last_applied {
            Some(id) => format!("{}-{}", id.leader_id.term, id.index),
            None => "empty".to_string(),
        };
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.last_membership,
            snapshot_id,
        };

        self.persist(&meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        info!(snapshot_id = %meta.snapshot_id, size = data.len(), "snapshot built");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl<S: KeyValueStore> RaftStateMachine<TypeConfig> for StateMachineStore<S> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId>, StoredMembership), RaftStorageError> {
        Ok((
            self.applied.last_applied,
            self.applied.last_membership.clone(),
        ))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<CommandResponse>, RaftStorageError>
    where
        I: IntoIterator<Item = Entry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut responses = Vec::new();
        for entry in entries {
            let log_id = entry.log_id;
            debug!(%log_id, "applying to state machine");
            match self.apply_entry(entry) {
                Ok(resp) => responses.push(resp),
                Err(e) => {
                    // Replicas must stay identical: a payload we cannot apply stops this node.
                    error!(%log_id, error = %e, "cannot apply committed entry");
                    return Err(StorageIOError::write_state_machine(&e).into());
                }
            }
        }
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, RaftStorageError> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), RaftStorageError> {
        let data = snapshot.into_inner();
        info!(snapshot_id = %meta.snapshot_id, size = data.len(), "installing snapshot");

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = codec::decode(&data)
            .map_err(|e| StorageIOError::read_snapshot(Some(meta.signature()), &e))?;
        let applied = AppliedState {
            last_applied: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
        };
        let marker =
            codec::encode(&applied).map_err(|e| StorageIOError::write_state_machine(&e))?;

        self.store
            .restore(&pairs, &marker)
            .map_err(|e| StorageIOError::write_state_machine(&e))?;
        self.applied = applied;

        self.persist(meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(Some(meta.signature()), &e))?;
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> Result<Option<Snapshot>, RaftStorageError> {
        let latest = self
            .snapshots
            .latest::<SnapshotMeta>()
            .map_err(|e| StorageIOError::read_snapshot(None, &e))?;
        Ok(latest.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::store::MemKV;
    use openraft::{BasicNode, CommittedLeaderId, Membership};
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    fn log_id(index: u64) -> LogId {
        LogId::new(CommittedLeaderId::new(1, 1), index)
    }

    fn normal(index: u64, cmd: Command) -> Entry {
        Entry {
            log_id: log_id(index),
            payload: EntryPayload::Normal(cmd.encode().unwrap()),
        }
    }

    fn commands() -> Vec<Entry> {
        let membership = Membership::new(
            vec![BTreeSet::from([1])],
            BTreeMap::from([(1, BasicNode::new("127.0.0.1:6543"))]),
        );
        vec![
            Entry {
                log_id: log_id(0),
                payload: EntryPayload::Membership(membership),
            },
            Entry {
                log_id: log_id(1),
                payload: EntryPayload::Blank,
            },
            normal(2, Command::set(b"b", b"2")),
            normal(3, Command::set(b"a", b"1")),
            normal(4, Command::set(b"c", b"3")),
            normal(5, Command::delete(b"b")),
            normal(6, Command::set(b"a", b"11")),
        ]
    }

    fn machine(dir: &TempDir, name: &str) -> (Arc<MemKV>, StateMachineStore<MemKV>) {
        let kv = Arc::new(MemKV::new());
        let snapshots = Arc::new(SnapshotStore::open(dir.path().join(name), 2).unwrap());
        let sm = StateMachineStore::new(Arc::clone(&kv), snapshots).unwrap();
        (kv, sm)
    }

    #[tokio::test]
    async fn replicas_converge_and_snapshot_identically() {
        let dir = TempDir::new().unwrap();
        let (kv1, mut sm1) = machine(&dir, "one");
        let (kv2, mut sm2) = machine(&dir, "two");

        let resp = sm1.apply(commands()).await.unwrap();
        assert_eq!(resp.len(), 7);
        assert_eq!(resp[6], CommandResponse { index: 6 });

        // second replica receives the same log in two batches
        let mut entries = commands();
        let tail = entries.split_off(3);
        sm2.apply(entries).await.unwrap();
        sm2.apply(tail).await.unwrap();

        assert_eq!(kv1.snapshot().unwrap().pairs, kv2.snapshot().unwrap().pairs);
        assert_eq!(kv1.get(b"a").unwrap(), b"11");
        assert!(matches!(kv1.get(b"b"), Err(StorageError::KeyNotFound)));

        let (applied, membership) = sm1.applied_state().await.unwrap();
        assert_eq!(applied, Some(log_id(6)));
        assert_eq!(membership.log_id(), &Some(log_id(0)));

        let snap1 = sm1.build_snapshot().await.unwrap();
        let snap2 = sm2.build_snapshot().await.unwrap();
        assert_eq!(snap1.snapshot.get_ref(), snap2.snapshot.get_ref());
        assert_eq!(snap1.meta.last_log_id, Some(log_id(6)));
    }

    #[tokio::test]
    async fn snapshot_restores_onto_an_empty_store() {
        let dir = TempDir::new().unwrap();
        let (kv1, mut sm1) = machine(&dir, "src");
        sm1.apply(commands()).await.unwrap();
        let snap = sm1.build_snapshot().await.unwrap();

        let (kv2, mut sm2) = machine(&dir, "dst");
        sm2.apply(vec![normal(0, Command::set(b"stale", b"x"))])
            .await
            .unwrap();
        sm2.install_snapshot(&snap.meta, snap.snapshot).await.unwrap();

        assert_eq!(kv1.snapshot().unwrap().pairs, kv2.snapshot().unwrap().pairs);
        assert!(kv2.get(b"stale").is_err());
        assert_eq!(sm2.applied_state().await.unwrap().0, Some(log_id(6)));

        let current = sm2.get_current_snapshot().await.unwrap().unwrap();
        assert_eq!(current.meta.snapshot_id, snap.meta.snapshot_id);

        // the marker survives a reload of the machine
        let snapshots = Arc::new(SnapshotStore::open(dir.path().join("dst"), 2).unwrap());
        let reloaded = StateMachineStore::new(kv2, snapshots).unwrap();
        assert_eq!(reloaded.applied.last_applied, Some(log_id(6)));
    }

    #[tokio::test]
    async fn malformed_payload_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (kv, mut sm) = machine(&dir, "bad");
        let entries = vec![
            normal(1, Command::set(b"k", b"v")),
            Entry {
                log_id: log_id(2),
                payload: EntryPayload::Normal(b"not a command".to_vec()),
            },
            normal(3, Command::set(b"after", b"v")),
        ];
        assert!(sm.apply(entries).await.is_err());

        // nothing past the bad entry was applied
        assert_eq!(kv.get(b"k").unwrap(), b"v");
        assert!(kv.get(b"after").is_err());
        assert_eq!(sm.applied_state().await.unwrap().0, Some(log_id(1)));
    }
}
