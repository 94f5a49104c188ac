//! Shared helpers for store integration tests.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use raftkv::{Store, StoreConfig, StoreError};
use tempfile::TempDir;

pub fn test_config(dir: &Path) -> StoreConfig {
    StoreConfig::new(dir)
        .with_listen_addr("127.0.0.1:0")
        .with_timing(50, (150, 300))
        .with_apply_timeout(Duration::from_secs(5))
        .with_rpc_timeout(Duration::from_secs(5))
}

/// Polls `check` until it returns true or `timeout_ms` elapses.
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

pub async fn wait_for_leader(store: &Store, timeout_ms: u64) -> bool {
    wait_until(timeout_ms, || async { store.leader().is_some() }).await
}

#[allow(dead_code)]
pub struct TestCluster {
    dirs: Vec<TempDir>,
    configure: fn(StoreConfig) -> StoreConfig,
    pub nodes: Vec<Store>,
}

#[allow(dead_code)]
impl TestCluster {
    /// Bootstraps the first node and joins the rest through it.
    pub async fn new(size: usize) -> TestCluster {
        TestCluster::with_config(size, |config| config).await
    }

    /// Like `new`, with `configure` applied to every node's config.
    pub async fn with_config(
        size: usize,
        configure: fn(StoreConfig) -> StoreConfig,
    ) -> TestCluster {
        let mut dirs = Vec::with_capacity(size);
        let mut nodes: Vec<Store> = Vec::with_capacity(size);

        for i in 0..size {
            let dir = TempDir::new().expect("temp dir");
            let mut config = configure(test_config(dir.path()));
            if i > 0 {
                config = config.with_join_addr(nodes[0].address());
            }
            let store = Store::create(config).await.expect("store starts");
            if i == 0 {
                assert!(wait_for_leader(&store, 5000).await, "bootstrap node elects itself");
            }
            dirs.push(dir);
            nodes.push(store);
        }

        TestCluster {
            dirs,
            configure,
            nodes,
        }
    }

    /// Stops node `i` and starts it again on the same directory and
    /// address, still configured to join through node 0.
    pub async fn restart(&mut self, i: usize) -> Result<&Store, StoreError> {
        let join_addr = self.nodes[0].address().to_string();
        let old = self.nodes.remove(i);
        let address = old.address().to_string();
        let _ = old.shutdown().await;
        drop(old);
        tokio::time::sleep(Duration::from_millis(300)).await;

        let mut config =
            (self.configure)(test_config(self.dirs[i].path())).with_listen_addr(address);
        if i > 0 {
            config = config.with_join_addr(join_addr);
        }
        let store = Store::create(config).await?;
        self.nodes.insert(i, store);
        Ok(&self.nodes[i])
    }

    pub fn leader(&self) -> &Store {
        self.nodes
            .iter()
            .find(|n| n.is_leader())
            .expect("a leader")
    }

    pub fn follower(&self) -> &Store {
        self.nodes
            .iter()
            .find(|n| !n.is_leader())
            .expect("a follower")
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            let _ = node.shutdown().await;
        }
    }
}
