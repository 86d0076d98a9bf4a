//! Key-value store seam
//!
//! The gateway talks to a Redis-shaped store: hashes for configuration, lists
//! for command and acknowledgement queues, plain keys for transmit
//! bookkeeping. Every call is independent; nothing here assumes transactions.

mod memory;

use std::collections::HashMap;

pub use memory::{MemoryStore, StoreCall};

use crate::Result;

/// Keys shared by the gateway processes.
pub mod schema {
    /// Configuration hash read by the config checkpoint.
    pub const CONFIG_KEY: &str = "m2m-config";
    /// Mobile-terminated events waiting for the command processor.
    pub const COMMAND_QUEUE_KEY: &str = "m2m-command:queue";
    /// Sequence numbers of acknowledgements to relay to command issuers.
    pub const ACK_QUEUE_KEY: &str = "m2m-ack:queue";
    /// Millisecond timestamp of the last relay on either path.
    pub const LAST_TIMESTAMP_KEY: &str = "m2m-transmit:last-timestamp";
    /// Millisecond timestamp of the last relay on the private path.
    pub const LAST_PRIVATE_TIMESTAMP_KEY: &str = "m2m-transmit:last-private-timestamp";
}

#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// All fields of a hash; empty when the key does not exist.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hmset(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Remove fields from a hash, returning how many existed.
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;

    /// Keys matching a glob pattern (`*` and `?`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn mset(&self, pairs: &[(String, String)]) -> Result<()>;

    /// Push onto the head of a list, returning the new length.
    async fn lpush(&self, key: &str, value: &str) -> Result<usize>;
}
