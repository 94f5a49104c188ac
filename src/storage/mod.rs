pub mod engine;
pub mod kv;
pub mod snapshot;
pub mod store;
