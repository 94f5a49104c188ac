//! Embeddable replicated key-value store.
//!
//! Writes are replicated through a raft log (openraft) and applied to a
//! local RocksDB keyspace on every member; reads are served locally.

pub mod error;
pub mod raft;
pub mod storage;
pub mod store;
pub mod utils;

pub use error::{
    ConfigError, ConsensusError, ForwardingError, RemoteError, SerializationError, StorageError,
    StoreError,
};
pub use raft::types::{ClusterMember, NodeId, NodeStatus};
pub use storage::kv::{Command, Operation};
pub use store::Store;
pub use utils::helpers::{parse_config, Config, StoreConfig};
