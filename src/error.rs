// Error taxonomy for the store.
//
// Each layer gets its own enum, the facade folds them into StoreError.
// RemoteError is the only one that crosses the wire.

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::types::NodeId;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("key not found")]
    KeyNotFound,

    #[error("engine: {0}")]
    Engine(#[from] rocksdb::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot meta: {0}")]
    Meta(#[from] serde_json::Error),

    #[error(transparent)]
    Codec(#[from] SerializationError),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("encode: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("timed out after {0:?} waiting for the entry to apply")]
    Timeout(Duration),

    #[error("not the leader (leader: {leader_id:?} at {leader_addr:?})")]
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },

    #[error("no known leader")]
    NoLeader,

    #[error("raft: {0}")]
    Raft(String),

    #[error("membership: {0}")]
    Membership(String),

    #[error("raft config: {0}")]
    Config(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Error reported by the remote side of an `apply_command` or `join` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RemoteError {
    #[error("not the leader (leader: {leader_id:?} at {leader_addr:?})")]
    NotLeader {
        leader_id: Option<NodeId>,
        leader_addr: Option<String>,
    },

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("consensus: {0}")]
    Consensus(String),
}

impl From<ConsensusError> for RemoteError {
    fn from(e: ConsensusError) -> Self {
        match e {
            ConsensusError::NotLeader {
                leader_id,
                leader_addr,
            } => RemoteError::NotLeader {
                leader_id,
                leader_addr,
            },
            other => RemoteError::Consensus(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForwardingError {
    #[error("connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("rpc to {addr}: {source}")]
    Rpc {
        addr: String,
        #[source]
        source: tarpc::client::RpcError,
    },

    #[error("{addr} rejected the request: {source}")]
    Remote {
        addr: String,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Encode(#[from] SerializationError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] io::Error),

    #[error("parsing yaml: {0}")]
    Yaml(#[from] yaml_rust2::ScanError),

    #[error("missing field `{0}`")]
    Missing(&'static str),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found")]
    KeyNotFound,

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Forwarding(#[from] ForwardingError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("rpc listener: {0}")]
    Listener(#[from] io::Error),
}

impl From<StorageError> for StoreError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::KeyNotFound => StoreError::KeyNotFound,
            StorageError::Codec(e) => StoreError::Serialization(e),
            other => StoreError::Storage(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_not_found_surfaces_on_the_facade() {
        let err: StoreError = StorageError::KeyNotFound.into();
        assert!(matches!(err, StoreError::KeyNotFound));

        let err: StoreError = StorageError::Corrupt("x".into()).into();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[test]
    fn not_leader_keeps_its_hint_over_the_wire() {
        let remote: RemoteError = ConsensusError::NotLeader {
            leader_id: Some(7),
            leader_addr: Some("10.0.0.7:6543".into()),
        }
        .into();
        assert_eq!(
            remote,
            RemoteError::NotLeader {
                leader_id: Some(7),
                leader_addr: Some("10.0.0.7:6543".into())
            }
        );

        let remote: RemoteError = ConsensusError::NoLeader.into();
        assert!(matches!(remote, RemoteError::Consensus(_)));
    }
}
