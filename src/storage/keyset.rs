use crate::error::KvRelError;
use crate::storage::key::is_subkey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ordered set of the scannable keys written under one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySet {
    keys: BTreeSet<String>,
}

impl KeySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KvRelError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, KvRelError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Returns true when the key was not already present.
    pub fn insert(&mut self, key: &str) -> bool {
        self.keys.insert(key.to_string())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.keys.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Keys strictly below `prefix`, in order.
    pub fn subkeys(&self, prefix: &str) -> Vec<String> {
        self.keys
            .range::<str, _>((
                std::ops::Bound::Excluded(prefix),
                std::ops::Bound::Unbounded,
            ))
            .take_while(|k| k.starts_with(prefix))
            .filter(|k| is_subkey(prefix, k))
            .cloned()
            .collect()
    }
}
