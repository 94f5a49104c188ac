// Store facade: wires the engine, the node identity, consensus, the
// snapshot store, the RPC listener and the cluster client together.
//
// Reads go straight to the local engine. Writes go through the log,
// either locally when this node leads or forwarded to the leader.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ConsensusError, ForwardingError, RemoteError, StorageError, StoreError};
use crate::raft::client::ClusterClient;
use crate::raft::conn::ConnectionLayer;
use crate::raft::raft::RaftNode;
use crate::raft::sm::StateMachineStore;
use crate::raft::state::LogStorage;
use crate::raft::types::{ClusterMember, NodeId, NodeStatus};
use crate::raft::util::load_or_init_node_id;
use crate::storage::engine::Engine;
use crate::storage::kv::Command;
use crate::storage::snapshot::SnapshotStore;
use crate::storage::store::KeyValueStore;
use crate::utils::helpers::StoreConfig;

pub struct Store {
    node: RaftNode,
    engine: Arc<Engine>,
    cluster: ClusterClient,
    conn: ConnectionLayer,
    address: String,
}

impl Store {
    /// Opens `directory` with default settings, joining the member at
    /// `join_addr` or bootstrapping a new cluster when it is None.
    pub async fn open(
        directory: impl Into<PathBuf>,
        join_addr: Option<&str>,
    ) -> Result<Store, StoreError> {
        let mut config = StoreConfig::new(directory);
        config.join_addr = join_addr.map(String::from);
        Store::create(config).await
    }

    pub async fn create(config: StoreConfig) -> Result<Store, StoreError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir).map_err(StorageError::Io)?;

        let engine = Arc::new(Engine::open(config.data_dir.join("db"))?);
        let node_id = load_or_init_node_id(engine.as_ref())?;
        let snapshots = Arc::new(SnapshotStore::open(
            config.data_dir.join("snapshots"),
            config.retain_snapshots,
        )?);

        let log_store = LogStorage::new(Arc::clone(&engine));
        let state_machine = StateMachineStore::new(Arc::clone(&engine), snapshots)?;
        let node = RaftNode::start(node_id, &config, log_store, state_machine).await?;

        let conn =
            ConnectionLayer::init_layer(&config.listen_addr, node.clone(), config.max_frame_length)
                .await?;
        let address = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| conn.local_addr.to_string());

        let store = Store {
            node,
            engine,
            cluster: ClusterClient::new(config.rpc_timeout, config.max_frame_length),
            conn,
            address,
        };

        let joined = match &config.join_addr {
            Some(join_addr) => store.join_cluster(join_addr).await,
            None => store.node.bootstrap(&store.address).await.map_err(StoreError::from),
        };
        if let Err(e) = joined {
            warn!(node_id, error = %e, "could not enter the cluster");
            let _ = store.shutdown().await;
            return Err(e);
        }

        info!(
            node_id,
            address = %store.address,
            data_dir = %config.data_dir.display(),
            "store ready"
        );
        Ok(store)
    }

    // A restarted member already knows its peers from the persisted
    // membership and does not ask again. A non-leader answers with the
    // leader's address; follow it once.
    async fn join_cluster(&self, target: &str) -> Result<(), StoreError> {
        if self.node.is_initialized().await? {
            info!(node_id = self.node.id(), "cluster state present, skipping join");
            return Ok(());
        }
        info!(node_id = self.node.id(), %target, "joining cluster");
        match self.cluster.join(target, self.node.id(), &self.address).await {
            Err(ForwardingError::Remote {
                source:
                    RemoteError::NotLeader {
                        leader_addr: Some(leader),
                        ..
                    },
                ..
            }) if leader != target => {
                debug!(%leader, "redirected to leader");
                self.cluster
                    .join(&leader, self.node.id(), &self.address)
                    .await?;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    /// Local read. A lagging follower may return a stale value.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        Ok(self.engine.get(key)?)
    }

    pub async fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.execute(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.execute(Command::delete(key)).await
    }

    async fn execute(&self, command: Command) -> Result<(), StoreError> {
        command.validate()?;

        if !self.node.is_leader() {
            let leader = self.node.leader().ok_or(ConsensusError::NoLeader)?;
            self.cluster.send_command(&leader.address, &command).await?;
            return Ok(());
        }

        let resp = self.node.propose(command.encode()?).await?;
        debug!(index = resp.index, op = ?command.operation, "command applied");
        Ok(())
    }

    /// Adds `node_id` at `address` as a voting member. Followers forward
    /// the request to the leader.
    pub async fn join(&self, node_id: NodeId, address: &str) -> Result<(), StoreError> {
        debug!(node_id, %address, "received join request");
        if self.node.is_leader() {
            self.node.add_member(node_id, address).await?;
            return Ok(());
        }
        let leader = self.node.leader().ok_or(ConsensusError::NoLeader)?;
        self.cluster.join(&leader.address, node_id, address).await?;
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    /// Address other members reach this node at.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_leader(&self) -> bool {
        self.node.is_leader()
    }

    pub fn leader(&self) -> Option<ClusterMember> {
        self.node.leader()
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        self.node.members()
    }

    pub fn status(&self) -> NodeStatus {
        self.node.status()
    }

    pub async fn snapshot(&self) -> Result<(), StoreError> {
        Ok(self.node.trigger_snapshot().await?)
    }

    pub async fn shutdown(&self) -> Result<(), StoreError> {
        self.conn.shutdown();
        self.node.shutdown().await?;
        Ok(())
    }
}
