//
// TCP layer for the consensus library: a tarpc listener serving
// ClusterRpc, and the openraft network factory dialing it on peers.
//
use std::future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use futures::StreamExt;
use openraft::error::{InstallSnapshotError, NetworkError, RemoteError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::BasicNode;
use tarpc::client;
use tarpc::context;
use tarpc::server::{self, Channel};
use tarpc::tokio_serde::formats::Json;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::raft::RaftNode;
use super::rpc::{ClusterRpc, ClusterRpcClient, RpcServer};
use super::types::{NodeId, RPCError, TypeConfig};

const MAX_CONCURRENT_CHANNELS: usize = 64;

#[derive(Debug)]
pub struct ConnectionLayer {
    pub local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl ConnectionLayer {
    pub async fn init_layer(
        addr: &str,
        node: RaftNode,
        max_frame_length: usize,
    ) -> io::Result<ConnectionLayer> {
        let mut listener = tarpc::serde_transport::tcp::listen(addr, Json::default).await?;
        listener.config_mut().max_frame_length(max_frame_length);
        let local_addr = listener.local_addr();
        info!(%local_addr, node_id = node.id(), "rpc listener bound");

        let server = RpcServer { node };
        let handle = tokio::spawn(async move {
            listener
                .filter_map(|r| future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .map(|channel| channel.execute(server.clone().serve()))
                .buffer_unordered(MAX_CONCURRENT_CHANNELS)
                .for_each(|_| async {})
                .await;
        });

        Ok(ConnectionLayer { local_addr, handle })
    }

    pub fn shutdown(&self) {
        self.handle.abort();
    }
}

impl Drop for ConnectionLayer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn connect(addr: &str, max_frame_length: usize) -> io::Result<ClusterRpcClient> {
    let mut transport = tarpc::serde_transport::tcp::connect(addr, Json::default);
    transport.config_mut().max_frame_length(max_frame_length);
    let transport = transport.await?;
    Ok(ClusterRpcClient::new(client::Config::default(), transport).spawn())
}

pub fn context_with_timeout(timeout: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + timeout;
    ctx
}

#[derive(Debug, Clone)]
pub struct Network {
    max_frame_length: usize,
}

impl Network {
    pub fn new(max_frame_length: usize) -> Network {
        Network { max_frame_length }
    }
}

impl RaftNetworkFactory<TypeConfig> for Network {
    type Network = NetworkConnection;

    async fn new_client(&mut self, target: NodeId, node: &BasicNode) -> Self::Network {
        NetworkConnection {
            target,
            addr: node.addr.clone(),
            max_frame_length: self.max_frame_length,
            client: None,
        }
    }
}

/// Link to one peer. The client is dialed lazily and dropped after any
/// transport failure so the next call reconnects.
pub struct NetworkConnection {
    target: NodeId,
    addr: String,
    max_frame_length: usize,
    client: Option<ClusterRpcClient>,
}

impl NetworkConnection {
    async fn client<E: std::error::Error + 'static>(
        &mut self,
    ) -> Result<ClusterRpcClient, RPCError<E>> {
        if let Some(client) = &self.client {
            return Ok(client.clone());
        }
        let client = connect(&self.addr, self.max_frame_length).await.map_err(|e| {
            warn!(peer = self.target, addr = %self.addr, error = %e, "peer unreachable");
            RPCError::Unreachable(Unreachable::new(&e))
        })?;
        self.client = Some(client.clone());
        Ok(client)
    }

    fn transport_failed<E: std::error::Error + 'static>(
        &mut self,
        e: &tarpc::client::RpcError,
    ) -> RPCError<E> {
        warn!(peer = self.target, addr = %self.addr, error = %e, "rpc failed");
        self.client = None;
        RPCError::Network(NetworkError::new(e))
    }
}

impl RaftNetwork<TypeConfig> for NetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError> {
        let client = self.client().await?;
        match client
            .append_entries(context_with_timeout(option.hard_ttl()), req)
            .await
        {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Err(e) => Err(self.transport_failed(&e)),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        option: RPCOption,
    ) -> Result<InstallSnapshotResponse<NodeId>, RPCError<InstallSnapshotError>> {
        let client = self.client().await?;
        match client
            .install_snapshot(context_with_timeout(option.hard_ttl()), req)
            .await
        {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Err(e) => Err(self.transport_failed(&e)),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError> {
        let client = self.client().await?;
        match client
            .vote(context_with_timeout(option.hard_ttl()), req)
            .await
        {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(RPCError::RemoteError(RemoteError::new(self.target, e))),
            Err(e) => Err(self.transport_failed(&e)),
        }
    }
}
