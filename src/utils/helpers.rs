// Node configuration: the StoreConfig builder used by the library
// and the YAML loader used by the binary.
//
// node_name: alpha
// store:
//   data_dir: /var/lib/raftkv
//   listen_addr: 0.0.0.0:6543
//   join_addr: 10.0.0.1:6543
//   apply_timeout_ms: 5000
//   max_frame_length: 67108864

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use yaml_rust2::{Yaml, YamlLoader};

use crate::error::ConfigError;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:6543";
pub const DEFAULT_RETAIN_SNAPSHOTS: usize = 2;
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Everything a node needs to open its data directory and take part in a cluster.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Address the RPC listener binds. Port 0 picks a free one.
    pub listen_addr: String,
    /// Address other members use to reach us. Defaults to the bound listen address.
    pub advertise_addr: Option<String>,
    /// Any existing member. When unset the node bootstraps a single-node cluster.
    pub join_addr: Option<String>,
    pub cluster_name: String,
    /// Upper bound on waiting for a local proposal to commit and apply.
    pub apply_timeout: Duration,
    /// Deadline for forwarded commands and join requests.
    pub rpc_timeout: Duration,
    /// Largest RPC frame accepted or sent, in bytes. Snapshot chunks are sized to fit.
    pub max_frame_length: usize,
    pub retain_snapshots: usize,
    pub snapshot_threshold: u64,
    pub trailing_logs: u64,
    pub heartbeat_interval_ms: u64,
    pub election_timeout_ms: (u64, u64),
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> StoreConfig {
        StoreConfig {
            data_dir: data_dir.into(),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            advertise_addr: None,
            join_addr: None,
            cluster_name: "raftkv".to_string(),
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            retain_snapshots: DEFAULT_RETAIN_SNAPSHOTS,
            snapshot_threshold: 8192,
            trailing_logs: 10240,
            heartbeat_interval_ms: 100,
            election_timeout_ms: (300, 600),
        }
    }

    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen_addr = addr.into();
        self
    }

    pub fn with_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = Some(addr.into());
        self
    }

    pub fn with_join_addr(mut self, addr: impl Into<String>) -> Self {
        self.join_addr = Some(addr.into());
        self
    }

    pub fn with_apply_timeout(mut self, timeout: Duration) -> Self {
        self.apply_timeout = timeout;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, bytes: usize) -> Self {
        self.max_frame_length = bytes;
        self
    }

    pub fn with_retain_snapshots(mut self, n: usize) -> Self {
        self.retain_snapshots = n;
        self
    }

    pub fn with_snapshot_threshold(mut self, logs: u64) -> Self {
        self.snapshot_threshold = logs;
        self
    }

    pub fn with_trailing_logs(mut self, logs: u64) -> Self {
        self.trailing_logs = logs;
        self
    }

    pub fn with_timing(mut self, heartbeat_ms: u64, election_ms: (u64, u64)) -> Self {
        self.heartbeat_interval_ms = heartbeat_ms;
        self.election_timeout_ms = election_ms;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing("data_dir"));
        }
        if self.listen_addr.is_empty() {
            return Err(ConfigError::Missing("listen_addr"));
        }
        if self.retain_snapshots == 0 {
            return Err(ConfigError::Invalid(
                "retain_snapshots must be at least 1".into(),
            ));
        }
        if self.max_frame_length < 1024 {
            return Err(ConfigError::Invalid(
                "max_frame_length must be at least 1024 bytes".into(),
            ));
        }
        if self.apply_timeout.is_zero() || self.rpc_timeout.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        let (min, max) = self.election_timeout_ms;
        if min >= max || self.heartbeat_interval_ms >= min {
            return Err(ConfigError::Invalid(format!(
                "need heartbeat ({}ms) < election min ({min}ms) < election max ({max}ms)",
                self.heartbeat_interval_ms
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub store: StoreConfig,
}

pub fn parse_config(path: PathBuf) -> Result<Config, ConfigError> {
    let raw = fs::read_to_string(&path)?;
    parse_config_str(&raw, path.parent())
}

// Relative data_dir entries resolve against the config file's directory.
fn parse_config_str(raw: &str, base: Option<&Path>) -> Result<Config, ConfigError> {
    let docs = YamlLoader::load_from_str(raw)?;
    let doc = docs.first().ok_or(ConfigError::Missing("store"))?;

    let node_name = doc["node_name"].as_str().unwrap_or("raftkv").to_string();

    let store = &doc["store"];
    if store.is_badvalue() {
        return Err(ConfigError::Missing("store"));
    }

    let data_dir = PathBuf::from(
        store["data_dir"]
            .as_str()
            .ok_or(ConfigError::Missing("data_dir"))?,
    );
    let data_dir = match base {
        Some(base) if data_dir.is_relative() => base.join(data_dir),
        _ => data_dir,
    };

    let mut config = StoreConfig::new(data_dir);

    if let Some(addr) = store["listen_addr"].as_str() {
        config.listen_addr = addr.to_string();
    }
    config.advertise_addr = store["advertise_addr"].as_str().map(String::from);
    config.join_addr = store["join_addr"].as_str().map(String::from);
    if let Some(name) = store["cluster_name"].as_str() {
        config.cluster_name = name.to_string();
    }
    if let Some(ms) = read_u64(store, "apply_timeout_ms")? {
        config.apply_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = read_u64(store, "rpc_timeout_ms")? {
        config.rpc_timeout = Duration::from_millis(ms);
    }
    if let Some(n) = read_u64(store, "retain_snapshots")? {
        config.retain_snapshots = to_usize(n, "retain_snapshots")?;
    }
    if let Some(n) = read_u64(store, "max_frame_length")? {
        config.max_frame_length = to_usize(n, "max_frame_length")?;
    }
    if let Some(n) = read_u64(store, "snapshot_threshold")? {
        config.snapshot_threshold = n;
    }
    if let Some(n) = read_u64(store, "trailing_logs")? {
        config.trailing_logs = n;
    }
    if let Some(ms) = read_u64(store, "heartbeat_interval_ms")? {
        config.heartbeat_interval_ms = ms;
    }
    if let Some(range) = store["election_timeout_ms"].as_vec() {
        match range.as_slice() {
            [min, max] => {
                config.election_timeout_ms = (
                    as_u64(min, "election_timeout_ms")?,
                    as_u64(max, "election_timeout_ms")?,
                )
            }
            _ => {
                return Err(ConfigError::Invalid(
                    "election_timeout_ms takes [min, max]".into(),
                ))
            }
        }
    }

    config.validate()?;
    Ok(Config { node_name, store: config })
}

fn read_u64(section: &Yaml, field: &'static str) -> Result<Option<u64>, ConfigError> {
    let value = &section[field];
    if value.is_badvalue() || value.is_null() {
        return Ok(None);
    }
    as_u64(value, field).map(Some)
}

fn to_usize(n: u64, field: &'static str) -> Result<usize, ConfigError> {
    usize::try_from(n)
        .map_err(|_| ConfigError::Invalid(format!("`{field}` is too large for this platform")))
}

fn as_u64(value: &Yaml, field: &'static str) -> Result<u64, ConfigError> {
    value
        .as_i64()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| ConfigError::Invalid(format!("`{field}` must be a non-negative integer")))
}
