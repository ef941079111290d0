//! Contract of the replicated transactional store this crate is layered on.
//!
//! The store offers registers (opaque bytes), counters and multi-field maps,
//! all addressed by string keys and all read and written inside a
//! transaction. There is no range scan and no secondary structure.

use crate::error::KvRelError;
use std::collections::BTreeMap;

pub type Bytes = Vec<u8>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    SetRegister { key: String, value: Bytes },
    ResetRegister { key: String },
    SetMapRegister {
        key: String,
        field: String,
        value: Bytes,
    },
}

/// Snapshot of one map object: register fields plus counter fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapObject {
    pub registers: BTreeMap<String, Bytes>,
    pub counters: BTreeMap<String, i64>,
}

impl MapObject {
    pub fn is_empty(&self) -> bool {
        self.registers.is_empty() && self.counters.is_empty()
    }

    pub fn register(&self, field: &str) -> Option<&Bytes> {
        self.registers.get(field)
    }

    pub fn counter(&self, field: &str) -> i64 {
        self.counters.get(field).copied().unwrap_or(0)
    }
}

#[allow(async_fn_in_trait)]
pub trait Backend: Send + Sync {
    type Transaction: BackendTransaction;

    /// Opens a transaction scoped to one bucket (key namespace).
    async fn start_transaction(&self, bucket: &str) -> Result<Self::Transaction, KvRelError>;
}

/// One open backend transaction.
///
/// Writes are buffered until `commit`. Counter increments made through
/// `fetch_add` are applied atomically and immediately and are not undone by
/// `abort`, so concurrent callers never observe the same value.
#[allow(async_fn_in_trait)]
pub trait BackendTransaction: Send {
    async fn read_registers(&mut self, keys: &[String]) -> Result<Vec<Option<Bytes>>, KvRelError>;

    async fn read_map(&mut self, key: &str) -> Result<MapObject, KvRelError>;

    async fn update(&mut self, ops: Vec<Operation>) -> Result<(), KvRelError>;

    /// Atomically adds `delta` to the map's counter field and returns the new value.
    async fn fetch_add(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, KvRelError>;

    /// Fails with `TransactionAborted` when a concurrent transaction committed
    /// a write to any key (or map register field) this one also wrote.
    async fn commit(self) -> Result<(), KvRelError>;

    async fn abort(self) -> Result<(), KvRelError>;
}
