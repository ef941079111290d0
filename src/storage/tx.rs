use crate::error::KvRelError;
use crate::storage::backend::{Backend, BackendTransaction, Bytes, MapObject, Operation};
use crate::storage::key::{KeyTerm, keyset_key};
use crate::storage::keyset::KeySet;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

/// One open transaction against the backend.
///
/// Register and map reads are cached for the lifetime of the handle and every
/// write refreshes the cache, so repeated reads of a key cost one round trip.
/// Writes to scannable keys are mirrored into the owning table's [`KeySet`],
/// which is written back on commit.
pub struct Transaction<T: BackendTransaction> {
    inner: T,
    id: u64,
    request_timeout: Duration,
    cache: HashMap<String, Option<Bytes>>,
    maps: HashMap<String, MapObject>,
    keysets: HashMap<String, KeySet>,
    dirty_keysets: BTreeSet<String>,
    failed: bool,
}

impl<T: BackendTransaction> Transaction<T> {
    pub async fn begin<B>(
        backend: &B,
        bucket: &str,
        request_timeout: Duration,
    ) -> Result<Self, KvRelError>
    where
        B: Backend<Transaction = T>,
    {
        let inner = bounded(request_timeout, backend.start_transaction(bucket)).await?;
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(tx = id, bucket, "transaction started");
        Ok(Self {
            inner,
            id,
            request_timeout,
            cache: HashMap::new(),
            maps: HashMap::new(),
            keysets: HashMap::new(),
            dirty_keysets: BTreeSet::new(),
            failed: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// True once a mutation on this handle has failed; such a handle can only
    /// be aborted.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Passes `result` through, marking the handle failed on error.
    pub(crate) fn settle<R>(&mut self, result: Result<R, KvRelError>) -> Result<R, KvRelError> {
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    /// Runs `f` on this handle instead of opening a nested transaction.
    pub async fn run_transaction<R>(
        &mut self,
        f: impl AsyncFnOnce(&mut Self) -> Result<R, KvRelError>,
    ) -> Result<R, KvRelError> {
        let result = f(self).await;
        self.settle(result)
    }

    /// Batched read; every key must exist.
    pub async fn get<V: DeserializeOwned>(&mut self, keys: &[KeyTerm]) -> Result<Vec<V>, KvRelError> {
        let found = self.try_get(keys).await?;
        found
            .into_iter()
            .zip(keys)
            .map(|(value, key)| {
                value.ok_or_else(|| KvRelError::MissingKey { key: key.encode() })
            })
            .collect()
    }

    /// Batched read; absent keys come back as `None`.
    pub async fn try_get<V: DeserializeOwned>(
        &mut self,
        keys: &[KeyTerm],
    ) -> Result<Vec<Option<V>>, KvRelError> {
        let encoded: Vec<String> = keys.iter().map(KeyTerm::encode).collect();
        let raw = self.read_registers(&encoded).await?;
        let mut out = Vec::with_capacity(raw.len());
        for bytes in raw {
            out.push(match bytes {
                Some(bytes) => Some(rmp_serde::from_slice(&bytes)?),
                None => None,
            });
        }
        Ok(out)
    }

    pub async fn put<V: Serialize>(&mut self, entries: &[(KeyTerm, V)]) -> Result<(), KvRelError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            if key.is_scannable() {
                self.load_keyset(key.table()).await?;
            }
            ops.push(Operation::SetRegister {
                key: key.encode(),
                value: rmp_serde::to_vec(value)?,
            });
        }
        bounded(self.request_timeout, self.inner.update(ops.clone())).await?;
        for (op, (key, _)) in ops.into_iter().zip(entries) {
            if let Operation::SetRegister { key: encoded, value } = op {
                if key.is_scannable() {
                    self.track(key.table(), &encoded, true);
                }
                self.cache.insert(encoded, Some(value));
            }
        }
        Ok(())
    }

    /// Resets the registers; absent keys are ignored.
    pub async fn remove(&mut self, keys: &[KeyTerm]) -> Result<(), KvRelError> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys.iter().filter(|k| k.is_scannable()) {
            self.load_keyset(key.table()).await?;
        }
        let ops = keys
            .iter()
            .map(|key| Operation::ResetRegister { key: key.encode() })
            .collect();
        bounded(self.request_timeout, self.inner.update(ops)).await?;
        for key in keys {
            let encoded = key.encode();
            if key.is_scannable() {
                self.track(key.table(), &encoded, false);
            }
            self.cache.insert(encoded, None);
        }
        Ok(())
    }

    /// Writes every entry iff each key is absent or already holds `expected`.
    pub async fn cond_put<V>(&mut self, entries: &[(KeyTerm, V)], expected: &V) -> Result<(), KvRelError>
    where
        V: Serialize + DeserializeOwned + PartialEq,
    {
        let keys: Vec<KeyTerm> = entries.iter().map(|(k, _)| k.clone()).collect();
        let current: Vec<Option<V>> = self.try_get(&keys).await?;
        for (key, value) in keys.iter().zip(&current) {
            if let Some(value) = value
                && value != expected
            {
                return Err(KvRelError::PreconditionFailed { key: key.encode() });
            }
        }
        self.put(entries).await
    }

    /// Keys strictly below `prefix`, in key order.
    pub async fn subkeys(&mut self, prefix: &KeyTerm) -> Result<Vec<KeyTerm>, KvRelError> {
        let table = prefix.table().to_string();
        self.load_keyset(&table).await?;
        let encoded = prefix.encode();
        let keys = self
            .keysets
            .get(&table)
            .map(|set| set.subkeys(&encoded))
            .unwrap_or_default();
        keys.iter().map(|k| KeyTerm::decode(k)).collect()
    }

    pub async fn read_map(&mut self, key: &str) -> Result<MapObject, KvRelError> {
        if let Some(map) = self.maps.get(key) {
            return Ok(map.clone());
        }
        let map = bounded(self.request_timeout, self.inner.read_map(key)).await?;
        self.maps.insert(key.to_string(), map.clone());
        Ok(map)
    }

    pub async fn update_map(&mut self, key: &str, fields: Vec<(String, Bytes)>) -> Result<(), KvRelError> {
        let ops = fields
            .iter()
            .map(|(field, value)| Operation::SetMapRegister {
                key: key.to_string(),
                field: field.clone(),
                value: value.clone(),
            })
            .collect();
        bounded(self.request_timeout, self.inner.update(ops)).await?;
        if let Some(map) = self.maps.get_mut(key) {
            map.registers.extend(fields);
        }
        Ok(())
    }

    /// Counter increments are applied immediately and survive an abort.
    pub async fn fetch_add(&mut self, key: &str, field: &str, delta: i64) -> Result<i64, KvRelError> {
        let value = bounded(self.request_timeout, self.inner.fetch_add(key, field, delta)).await?;
        if let Some(map) = self.maps.get_mut(key) {
            map.counters.insert(field.to_string(), value);
        }
        Ok(value)
    }

    pub(crate) async fn get_register(&mut self, key: &str) -> Result<Option<Bytes>, KvRelError> {
        let mut found = self.read_registers(&[key.to_string()]).await?;
        Ok(found.pop().flatten())
    }

    pub(crate) async fn put_register(&mut self, key: &str, value: Bytes) -> Result<(), KvRelError> {
        let op = Operation::SetRegister {
            key: key.to_string(),
            value: value.clone(),
        };
        bounded(self.request_timeout, self.inner.update(vec![op])).await?;
        self.cache.insert(key.to_string(), Some(value));
        Ok(())
    }

    /// Publishes every buffered write. A failed handle is aborted instead and
    /// reports `TransactionAborted`.
    pub async fn commit(mut self) -> Result<(), KvRelError> {
        if self.failed {
            let id = self.id;
            bounded(self.request_timeout, self.inner.abort()).await?;
            warn!(tx = id, "commit refused after a failed mutation");
            return Err(KvRelError::TransactionAborted {
                reason: format!("transaction {id} had a failed mutation"),
            });
        }
        let dirty = std::mem::take(&mut self.dirty_keysets);
        let mut ops = Vec::with_capacity(dirty.len());
        for table in dirty {
            if let Some(set) = self.keysets.get(&table) {
                ops.push(Operation::SetRegister {
                    key: keyset_key(&table),
                    value: set.to_bytes()?,
                });
            }
        }
        if !ops.is_empty() {
            bounded(self.request_timeout, self.inner.update(ops)).await?;
        }
        let id = self.id;
        match bounded(self.request_timeout, self.inner.commit()).await {
            Ok(()) => {
                debug!(tx = id, "transaction committed");
                Ok(())
            }
            Err(err) => {
                warn!(tx = id, error = %err, "transaction commit failed");
                Err(err)
            }
        }
    }

    pub async fn abort(self) -> Result<(), KvRelError> {
        let id = self.id;
        bounded(self.request_timeout, self.inner.abort()).await?;
        debug!(tx = id, "transaction aborted");
        Ok(())
    }

    async fn read_registers(&mut self, keys: &[String]) -> Result<Vec<Option<Bytes>>, KvRelError> {
        let misses: Vec<String> = keys
            .iter()
            .filter(|k| !self.cache.contains_key(*k))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !misses.is_empty() {
            let fetched = bounded(self.request_timeout, self.inner.read_registers(&misses)).await?;
            self.cache.extend(misses.into_iter().zip(fetched));
        }
        Ok(keys
            .iter()
            .map(|k| self.cache.get(k).cloned().flatten())
            .collect())
    }

    async fn load_keyset(&mut self, table: &str) -> Result<(), KvRelError> {
        if self.keysets.contains_key(table) {
            return Ok(());
        }
        let set = match self.get_register(&keyset_key(table)).await? {
            Some(bytes) => KeySet::from_bytes(&bytes)?,
            None => KeySet::new(),
        };
        self.keysets.insert(table.to_string(), set);
        Ok(())
    }

    fn track(&mut self, table: &str, key: &str, present: bool) {
        let Some(set) = self.keysets.get_mut(table) else {
            return;
        };
        let changed = if present {
            set.insert(key)
        } else {
            set.remove(key)
        };
        if changed {
            self.dirty_keysets.insert(table.to_string());
        }
    }
}

async fn bounded<R>(
    timeout: Duration,
    fut: impl Future<Output = Result<R, KvRelError>>,
) -> Result<R, KvRelError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(timeout_ms, "backend request timed out");
            Err(KvRelError::Timeout { timeout_ms })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Transaction;
    use crate::catalog::types::Value;
    use crate::storage::key::KeyTerm;
    use crate::storage::memory::MemoryBackend;
    use std::time::Duration;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn field(pk: u64) -> KeyTerm {
        KeyTerm::Field {
            table: "A".into(),
            pk,
            field: "fieldA".into(),
        }
    }

    fn entry(value: &str, pk: u64) -> KeyTerm {
        KeyTerm::IndexPrimaryKey {
            table: "A".into(),
            index: "ix".into(),
            field: "fieldA".into(),
            value: Value::from(value),
            pk,
        }
    }

    fn sentinel(value: &str) -> KeyTerm {
        KeyTerm::IndexField {
            table: "A".into(),
            index: "ix".into(),
            field: "fieldA".into(),
            value: Value::from(value),
        }
    }

    #[tokio::test]
    async fn get_fails_on_absent_key_while_try_get_does_not() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        let err = tx.get::<Value>(&[field(1)]).await.expect_err("missing");
        assert_eq!(err.code_str(), "missing_key");
        let found = tx.try_get::<Value>(&[field(1)]).await.expect("try_get");
        assert_eq!(found, vec![None]);

        tx.put(&[(field(1), Value::from("x"))]).await.expect("put");
        let got: Vec<Value> = tx.get(&[field(1)]).await.expect("get");
        assert_eq!(got, vec![Value::from("x")]);
    }

    #[tokio::test]
    async fn cond_put_accepts_absent_or_expected() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        let key = KeyTerm::UniqueIndex {
            table: "A".into(),
            index: "ux".into(),
            field: "fieldA".into(),
            value: Value::from("dup"),
        };
        tx.cond_put(&[(key.clone(), 1_u64)], &1).await.expect("absent");
        tx.cond_put(&[(key.clone(), 1_u64)], &1).await.expect("same owner");
        let err = tx.cond_put(&[(key, 2_u64)], &2).await.expect_err("taken");
        assert_eq!(err.code_str(), "precondition_failed");
    }

    #[tokio::test]
    async fn subkeys_follow_puts_and_removes_across_commits() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        tx.put(&[(sentinel("v"), ()), (entry("v", 1), ()), (entry("v", 2), ())])
            .await
            .expect("put");
        assert_eq!(
            tx.subkeys(&sentinel("v")).await.expect("scan"),
            vec![entry("v", 1), entry("v", 2)]
        );
        tx.commit().await.expect("commit");

        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        tx.remove(&[entry("v", 1)]).await.expect("remove");
        assert_eq!(
            tx.subkeys(&sentinel("v")).await.expect("scan"),
            vec![entry("v", 2)]
        );
        tx.abort().await.expect("abort");

        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        assert_eq!(tx.subkeys(&sentinel("v")).await.expect("scan").len(), 2);
    }

    #[tokio::test]
    async fn joined_closure_shares_the_handle() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        let id = tx.id();
        let seen = tx
            .run_transaction(async |inner| {
                inner.put(&[(field(1), Value::from("x"))]).await?;
                Ok(inner.id())
            })
            .await
            .expect("joined");
        assert_eq!(seen, id);
        let got: Vec<Value> = tx.get(&[field(1)]).await.expect("visible");
        assert_eq!(got, vec![Value::from("x")]);
    }

    #[tokio::test]
    async fn failed_joined_body_blocks_commit() {
        let backend = MemoryBackend::new();
        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        let err = tx
            .run_transaction(async |inner| {
                inner.put(&[(field(1), Value::from("half"))]).await?;
                inner.get::<Value>(&[field(2)]).await
            })
            .await
            .expect_err("missing key");
        assert_eq!(err.code_str(), "missing_key");
        assert!(tx.is_failed());
        let err = tx.commit().await.expect_err("failed handle");
        assert_eq!(err.code_str(), "transaction_aborted");

        let mut tx = Transaction::begin(&backend, "b", TIMEOUT).await.expect("begin");
        let found = tx.try_get::<Value>(&[field(1)]).await.expect("read");
        assert_eq!(found, vec![None]);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out() {
        let backend = MemoryBackend::new().with_latency(Duration::from_millis(50));
        let mut tx = Transaction::begin(&backend, "b", Duration::from_millis(100))
            .await
            .expect("begin");
        tx.try_get::<Value>(&[field(1)]).await.expect("fast enough");

        let slow = MemoryBackend::new().with_latency(Duration::from_millis(500));
        let err = Transaction::begin(&slow, "b", Duration::from_millis(100))
            .await
            .err()
            .expect("timed out");
        assert_eq!(err.code_str(), "timeout");
    }
}
