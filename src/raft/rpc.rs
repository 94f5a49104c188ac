// One tarpc service carries both the consensus traffic between
// members and the application endpoints (forwarded commands, joins).
use openraft::error::InstallSnapshotError;
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use tarpc::context;
use tracing::debug;

use super::raft::RaftNode;
use super::types::{CommandResponse, NodeId, RaftError, TypeConfig};
use crate::error::RemoteError;
use crate::storage::kv::Command;

#[tarpc::service]
pub trait ClusterRpc {
    async fn append_entries(
        req: AppendEntriesRequest<TypeConfig>,
    ) -> Result<AppendEntriesResponse<NodeId>, RaftError>;

    async fn vote(req: VoteRequest<NodeId>) -> Result<VoteResponse<NodeId>, RaftError>;

    async fn install_snapshot(
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> Result<InstallSnapshotResponse<NodeId>, RaftError<InstallSnapshotError>>;

    /// Proposes an encoded Command. Only the leader accepts it.
    async fn apply_command(payload: Vec<u8>) -> Result<CommandResponse, RemoteError>;

    /// Adds `node_id` at `address` as a voter. Only the leader accepts it.
    async fn join(node_id: NodeId, address: String) -> Result<(), RemoteError>;
}

#[derive(Clone)]
pub struct RpcServer {
    pub node: RaftNode,
}

impl RpcServer {
    fn not_leader(&self) -> RemoteError {
        let leader = self.node.leader();
        RemoteError::NotLeader {
            leader_id: leader.as_ref().map(|m| m.node_id),
            leader_addr: leader.map(|m| m.address),
        }
    }
}

#[tarpc::server]
impl ClusterRpc for RpcServer {
    async fn append_entries(
        self,
        _: context::Context,
        req: AppendEntriesRequest<TypeConfig>,
    ) -> Result<AppendEntriesResponse<NodeId>, RaftError> {
        self.node.raft().append_entries(req).await
    }

    async fn vote(
        self,
        _: context::Context,
        req: VoteRequest<NodeId>,
    ) -> Result<VoteResponse<NodeId>, RaftError> {
        self.node.raft().vote(req).await
    }

    async fn install_snapshot(
        self,
        _: context::Context,
        req: InstallSnapshotRequest<TypeConfig>,
    ) -> Result<InstallSnapshotResponse<NodeId>, RaftError<InstallSnapshotError>> {
        self.node.raft().install_snapshot(req).await
    }

    async fn apply_command(
        self,
        _: context::Context,
        payload: Vec<u8>,
    ) -> Result<CommandResponse, RemoteError> {
        // never let a malformed command reach the log
        let command =
            Command::decode(&payload).map_err(|e| RemoteError::InvalidCommand(e.to_string()))?;
        debug!(op = ?command.operation, key_len = command.key.len(), "forwarded command");

        if !self.node.is_leader() {
            return Err(self.not_leader());
        }
        Ok(self.node.propose(payload).await?)
    }

    async fn join(
        self,
        _: context::Context,
        node_id: NodeId,
        address: String,
    ) -> Result<(), RemoteError> {
        debug!(node_id, %address, "join request");
        if !self.node.is_leader() {
            return Err(self.not_leader());
        }
        Ok(self.node.add_member(node_id, &address).await?)
    }
}
