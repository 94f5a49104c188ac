/*
    Handle over the openraft instance.

    Reference:
    In search of an understandable consensus algorithm
    https://raft.github.io/raft.pdf
*/

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use openraft::error::RaftError as OpenRaftError;
use openraft::storage::{RaftLogStorage, RaftStateMachine};
use openraft::{BasicNode, Config, RaftMetrics, SnapshotPolicy};
use tracing::{debug, info};

use super::conn::Network;
use super::types::{
    ClientWriteError, ClusterMember, CommandResponse, InitializeError, NodeId, NodeStatus, Raft,
    RaftError, TypeConfig,
};
use crate::error::ConsensusError;
use crate::utils::helpers::StoreConfig;

#[derive(Clone)]
pub struct RaftNode {
    id: NodeId,
    raft: Raft,
    apply_timeout: Duration,
}

impl RaftNode {
    pub async fn start<LS, SM>(
        id: NodeId,
        config: &StoreConfig,
        log_store: LS,
        state_machine: SM,
    ) -> Result<RaftNode, ConsensusError>
    where
        LS: RaftLogStorage<TypeConfig>,
        SM: RaftStateMachine<TypeConfig>,
    {
        let raft_config = Config {
            cluster_name: config.cluster_name.clone(),
            heartbeat_interval: config.heartbeat_interval_ms,
            election_timeout_min: config.election_timeout_ms.0,
            election_timeout_max: config.election_timeout_ms.1,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            max_in_snapshot_log_to_keep: config.trailing_logs,
            // JSON spells each byte as a decimal number, so leave headroom.
            snapshot_max_chunk_size: (config.max_frame_length / 8) as u64,
            ..Default::default()
        }
        .validate()
        .map_err(|e| ConsensusError::Config(e.to_string()))?;

        let raft = Raft::new(
            id,
            Arc::new(raft_config),
            Network::new(config.max_frame_length),
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| ConsensusError::Fatal(e.to_string()))?;

        info!(node_id = id, "consensus started");
        Ok(RaftNode {
            id,
            raft,
            apply_timeout: config.apply_timeout,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn raft(&self) -> &Raft {
        &self.raft
    }

    /// Makes this node the sole voter of a fresh cluster. A node that already
    /// has cluster state keeps it.
    pub async fn bootstrap(&self, address: &str) -> Result<(), ConsensusError> {
        let members = BTreeMap::from([(self.id, BasicNode::new(address))]);
        match self.raft.initialize(members).await {
            Ok(()) => {
                info!(node_id = self.id, %address, "bootstrapped single-node cluster");
                Ok(())
            }
            Err(OpenRaftError::APIError(InitializeError::NotAllowed(_))) => {
                debug!(node_id = self.id, "cluster state already present, not bootstrapping");
                Ok(())
            }
            Err(e) => Err(ConsensusError::Raft(e.to_string())),
        }
    }

    /// True once this node holds a vote or any log, i.e. it already
    /// belongs to a cluster.
    pub async fn is_initialized(&self) -> Result<bool, ConsensusError> {
        self.raft
            .is_initialized()
            .await
            .map_err(|e| ConsensusError::Fatal(e.to_string()))
    }

    /// Submits an encoded command and waits for it to be committed and applied.
    pub async fn propose(&self, payload: Vec<u8>) -> Result<CommandResponse, ConsensusError> {
        match tokio::time::timeout(self.apply_timeout, self.raft.client_write(payload)).await {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(e)) => Err(write_error(e)),
            // the entry may still commit later
            Err(_) => Err(ConsensusError::Timeout(self.apply_timeout)),
        }
    }

    /// Adds a node as a learner, waits for it to catch up, then promotes it to voter.
    pub async fn add_member(&self, node_id: NodeId, address: &str) -> Result<(), ConsensusError> {
        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        let is_voter = membership.voter_ids().any(|id| id == node_id);
        let same_addr = node_addr(&metrics, node_id).is_some_and(|addr| addr == address);
        if is_voter && same_addr {
            debug!(node_id, %address, "already a voter");
            return Ok(());
        }

        info!(node_id, %address, "adding learner");
        self.raft
            .add_learner(node_id, BasicNode::new(address), true)
            .await
            .map_err(write_error)?;

        let mut voters: BTreeSet<NodeId> = self
            .metrics()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        voters.insert(node_id);

        info!(node_id, voters = ?voters, "promoting to voter");
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(write_error)?;
        Ok(())
    }

    pub fn metrics(&self) -> RaftMetrics<NodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.metrics().borrow().current_leader == Some(self.id)
    }

    /// The current leader, when one is known along with its address.
    pub fn leader(&self) -> Option<ClusterMember> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        node_addr(&metrics, leader).map(|address| ClusterMember {
            node_id: leader,
            address,
        })
    }

    pub fn members(&self) -> Vec<ClusterMember> {
        let metrics = self.metrics();
        let membership = metrics.membership_config.membership();
        membership
            .voter_ids()
            .filter_map(|id| {
                node_addr(&metrics, id).map(|address| ClusterMember {
                    node_id: id,
                    address,
                })
            })
            .collect()
    }

    pub fn status(&self) -> NodeStatus {
        let metrics = self.metrics();
        NodeStatus {
            node_id: self.id,
            role: format!("{:?}", metrics.state),
            term: metrics.current_term,
            leader: metrics.current_leader,
            last_log_index: metrics.last_log_index,
            last_applied: metrics.last_applied.map(|id| id.index),
            members: self.members(),
        }
    }

    pub async fn trigger_snapshot(&self) -> Result<(), ConsensusError> {
        self.raft
            .trigger()
            .snapshot()
            .await
            .map_err(|e| ConsensusError::Fatal(e.to_string()))
    }

    pub async fn shutdown(&self) -> Result<(), ConsensusError> {
        self.raft
            .shutdown()
            .await
            .map_err(|e| ConsensusError::Fatal(e.to_string()))?;
        info!(node_id = self.id, "consensus stopped");
        Ok(())
    }
}

fn node_addr(metrics: &RaftMetrics<NodeId, BasicNode>, id: NodeId) -> Option<String> {
    metrics
        .membership_config
        .nodes()
        .find(|(node_id, _)| **node_id == id)
        .map(|(_, node)| node.addr.clone())
}

fn write_error(e: RaftError<ClientWriteError>) -> ConsensusError {
    match e {
        OpenRaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
            ConsensusError::NotLeader {
                leader_id: forward.leader_id,
                leader_addr: forward.leader_node.map(|node| node.addr),
            }
        }
        OpenRaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => {
            ConsensusError::Membership(e.to_string())
        }
        OpenRaftError::Fatal(e) => ConsensusError::Fatal(e.to_string()),
    }
}
