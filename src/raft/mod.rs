pub mod client;
pub mod conn;
#[allow(clippy::module_inception)]
pub mod raft;
pub mod rpc;
pub mod sm;
pub mod state;
pub mod types;
pub mod util;
