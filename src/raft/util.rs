use rand::Rng;
use tracing::info;

use super::types::NodeId;
use crate::error::StorageError;
use crate::storage::store::StableStore;

pub const NODE_ID_FIELD: &[u8] = b"node_id";

/// Random non-zero id.
pub fn nodeid_rand_u64() -> NodeId {
    let mut rng = rand::thread_rng();
    loop {
        let id: u64 = rng.gen();
        if id != 0 {
            return id;
        }
    }
}

/// Reads the persisted node id, generating and storing one on first start.
pub fn load_or_init_node_id<S: StableStore>(stable: &S) -> Result<NodeId, StorageError> {
    match stable.get_u64(NODE_ID_FIELD) {
        Ok(id) => Ok(id),
        Err(StorageError::KeyNotFound) => {
            let id = nodeid_rand_u64();
            stable.set_u64(NODE_ID_FIELD, id)?;
            info!(node_id = id, "generated node identity");
            Ok(id)
        }
        Err(e) => Err(e),
    }
}
