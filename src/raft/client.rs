// Client side of the application endpoints: forwards a write or a
// join request to the leader. One cached connection per address;
// a transport failure evicts it.
use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::conn::{connect, context_with_timeout};
use super::rpc::ClusterRpcClient;
use super::types::{CommandResponse, NodeId};
use crate::error::ForwardingError;
use crate::storage::kv::Command;

pub struct ClusterClient {
    timeout: Duration,
    max_frame_length: usize,
    clients: Mutex<HashMap<String, ClusterRpcClient>>,
}

impl ClusterClient {
    pub fn new(timeout: Duration, max_frame_length: usize) -> ClusterClient {
        ClusterClient {
            timeout,
            max_frame_length,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, addr: &str) -> Result<ClusterRpcClient, ForwardingError> {
        let cached = self.clients.lock().get(addr).cloned();
        if let Some(client) = cached {
            return Ok(client);
        }
        let client = connect(addr, self.max_frame_length)
            .await
            .map_err(|source| ForwardingError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        self.clients.lock().insert(addr.to_string(), client.clone());
        Ok(client)
    }

    fn evict(&self, addr: &str, source: tarpc::client::RpcError) -> ForwardingError {
        warn!(%addr, error = %source, "forwarding rpc failed");
        self.clients.lock().remove(addr);
        ForwardingError::Rpc {
            addr: addr.to_string(),
            source,
        }
    }

    /// Sends `command` to the leader at `leader_addr` and waits for it to apply there.
    pub async fn send_command(
        &self,
        leader_addr: &str,
        command: &Command,
    ) -> Result<CommandResponse, ForwardingError> {
        let payload = command.encode()?;
        let client = self.client(leader_addr).await?;
        debug!(%leader_addr, op = ?command.operation, "forwarding command");

        match client
            .apply_command(context_with_timeout(self.timeout), payload)
            .await
        {
            Ok(result) => result.map_err(|source| ForwardingError::Remote {
                addr: leader_addr.to_string(),
                source,
            }),
            Err(e) => Err(self.evict(leader_addr, e)),
        }
    }

    /// Asks the member at `target` to add `node_id` at `address` to the cluster.
    pub async fn join(
        &self,
        target: &str,
        node_id: NodeId,
        address: &str,
    ) -> Result<(), ForwardingError> {
        let client = self.client(target).await?;
        debug!(%target, node_id, %address, "sending join request");

        match client
            .join(context_with_timeout(self.timeout), node_id, address.to_string())
            .await
        {
            Ok(result) => result.map_err(|source| ForwardingError::Remote {
                addr: target.to_string(),
                source,
            }),
            Err(e) => Err(self.evict(target, e)),
        }
    }
}
