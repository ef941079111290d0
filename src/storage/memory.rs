use crate::error::KvRelError;
use crate::storage::backend::{Backend, BackendTransaction, Bytes, MapObject, Operation};
use im::OrdMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
struct Versioned {
    seq: u64,
    value: Option<Bytes>,
}

/// Committed register state of one bucket. Cloning is O(1), which is what
/// gives every transaction its own snapshot.
#[derive(Debug, Clone, Default)]
struct Committed {
    registers: OrdMap<String, Versioned>,
    maps: OrdMap<String, OrdMap<String, Versioned>>,
}

#[derive(Debug, Default)]
struct BucketState {
    committed: Committed,
    counters: HashMap<String, BTreeMap<String, i64>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    seq: u64,
    buckets: HashMap<String, BucketState>,
}

/// In-process implementation of the backend contract.
///
/// Transactions read from a snapshot taken at start, buffer their writes and
/// validate them first-committer-wins at commit time. Counters live outside
/// the snapshot and are updated atomically.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
    latency: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every round trip, to emulate a remote store.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Committed register keys of a bucket, in key order.
    pub fn register_keys(&self, bucket: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .buckets
            .get(bucket)
            .map(|b| {
                b.committed
                    .registers
                    .iter()
                    .filter(|(_, v)| v.value.is_some())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn commit_seq(&self) -> u64 {
        self.state.lock().seq
    }
}

impl Backend for MemoryBackend {
    type Transaction = MemoryTransaction;

    async fn start_transaction(&self, bucket: &str) -> Result<MemoryTransaction, KvRelError> {
        simulate_latency(self.latency).await;
        let mut state = self.state.lock();
        let snapshot_seq = state.seq;
        let snapshot = state
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .committed
            .clone();
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            bucket: bucket.to_string(),
            snapshot,
            snapshot_seq,
            writes: BTreeMap::new(),
            map_writes: BTreeMap::new(),
            latency: self.latency,
        })
    }
}

#[derive(Debug)]
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    bucket: String,
    snapshot: Committed,
    snapshot_seq: u64,
    writes: BTreeMap<String, Option<Bytes>>,
    map_writes: BTreeMap<String, BTreeMap<String, Bytes>>,
    latency: Option<Duration>,
}

impl BackendTransaction for MemoryTransaction {
    async fn read_registers(&mut self, keys: &[String]) -> Result<Vec<Option<Bytes>>, KvRelError> {
        simulate_latency(self.latency).await;
        Ok(keys
            .iter()
            .map(|key| match self.writes.get(key) {
                Some(local) => local.clone(),
                None => self
                    .snapshot
                    .registers
                    .get(key)
                    .and_then(|v| v.value.clone()),
            })
            .collect())
    }

    async fn read_map(&mut self, key: &str) -> Result<MapObject, KvRelError> {
        simulate_latency(self.latency).await;
        let mut registers: BTreeMap<String, Bytes> = self
            .snapshot
            .maps
            .get(key)
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|(f, v)| v.value.clone().map(|value| (f.clone(), value)))
                    .collect()
            })
            .unwrap_or_default();
        if let Some(local) = self.map_writes.get(key) {
            registers.extend(local.iter().map(|(f, v)| (f.clone(), v.clone())));
        }
        let counters = {
            let state = self.state.lock();
            state
                .buckets
                .get(&self.bucket)
                .and_then(|b| b.counters.get(key))
                .cloned()
                .unwrap_or_default()
        };
        Ok(MapObject {
            registers,
            counters,
        })
    }

    async fn update(&mut self, ops: Vec<Operation>) -> Result<(), KvRelError> {
        simulate_latency(self.latency).await;
        for op in ops {
            match op {
                Operation::SetRegister { key, value } => {
                    self.writes.insert(key, Some(value));
                }
                Operation::ResetRegister { key } => {
                    self.writes.insert(key, None);
                }
                Operation::SetMapRegister { key, field, value } => {
                    self.map_writes.entry(key).or_default().insert(field, value);
                }
            }
        }
        Ok(())
    }

    async fn fetch_add(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, KvRelError> {
        simulate_latency(self.latency).await;
        let mut state = self.state.lock();
        let counter = state
            .buckets
            .entry(self.bucket.clone())
            .or_default()
            .counters
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *counter += delta;
        Ok(*counter)
    }

    async fn commit(self) -> Result<(), KvRelError> {
        simulate_latency(self.latency).await;
        let mut state = self.state.lock();
        let next_seq = state.seq + 1;
        let bucket = state.buckets.entry(self.bucket.clone()).or_default();

        for key in self.writes.keys() {
            if let Some(current) = bucket.committed.registers.get(key)
                && current.seq > self.snapshot_seq
            {
                return Err(KvRelError::TransactionAborted {
                    reason: format!("write-write conflict on key {key:?}"),
                });
            }
        }
        for (key, fields) in &self.map_writes {
            let Some(committed_fields) = bucket.committed.maps.get(key) else {
                continue;
            };
            for field in fields.keys() {
                if let Some(current) = committed_fields.get(field)
                    && current.seq > self.snapshot_seq
                {
                    return Err(KvRelError::TransactionAborted {
                        reason: format!("write-write conflict on {key:?}.{field}"),
                    });
                }
            }
        }

        if self.writes.is_empty() && self.map_writes.is_empty() {
            return Ok(());
        }
        for (key, value) in self.writes {
            bucket.committed.registers.insert(
                key,
                Versioned {
                    seq: next_seq,
                    value,
                },
            );
        }
        for (key, fields) in self.map_writes {
            let mut committed_fields = bucket.committed.maps.get(&key).cloned().unwrap_or_default();
            for (field, value) in fields {
                committed_fields.insert(
                    field,
                    Versioned {
                        seq: next_seq,
                        value: Some(value),
                    },
                );
            }
            bucket.committed.maps.insert(key, committed_fields);
        }
        state.seq = next_seq;
        Ok(())
    }

    async fn abort(self) -> Result<(), KvRelError> {
        Ok(())
    }
}

async fn simulate_latency(latency: Option<Duration>) {
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
}
