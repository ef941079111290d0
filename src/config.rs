use crate::error::KvRelError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ENV_ENDPOINT: &str = "KVREL_ENDPOINT";
pub const ENV_BUCKET: &str = "KVREL_BUCKET";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "KVREL_REQUEST_TIMEOUT_MS";

/// Connection settings handed to the backing store.
///
/// The endpoint and bucket are opaque to this crate: they are passed through
/// to the backend unchanged. The request timeout bounds every individual
/// backend round trip made by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:8087".into(),
            bucket: "default-bucket".into(),
            request_timeout_ms: 5_000,
        }
    }
}

impl StoreConfig {
    pub fn development() -> Self {
        Self {
            request_timeout_ms: 30_000,
            ..Self::default()
        }
    }

    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = bucket.into();
        self
    }

    pub fn with_request_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.request_timeout_ms = timeout_ms;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Overlays `KVREL_*` environment variables on top of the defaults.
    pub fn from_env() -> Result<Self, KvRelError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KvRelError> {
        let mut config = Self::default();
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            config.endpoint = endpoint;
        }
        if let Some(bucket) = lookup(ENV_BUCKET) {
            config.bucket = bucket;
        }
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            config.request_timeout_ms =
                raw.trim()
                    .parse()
                    .map_err(|_| KvRelError::InvalidConfig {
                        message: format!("{ENV_REQUEST_TIMEOUT_MS} must be an integer, got {raw:?}"),
                    })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KvRelError> {
        if self.endpoint.trim().is_empty() {
            return Err(KvRelError::InvalidConfig {
                message: "endpoint must not be empty".into(),
            });
        }
        if self.bucket.trim().is_empty() {
            return Err(KvRelError::InvalidConfig {
                message: "bucket must not be empty".into(),
            });
        }
        if self.request_timeout_ms == 0 {
            return Err(KvRelError::InvalidConfig {
                message: "request_timeout_ms must be > 0".into(),
            });
        }
        Ok(())
    }
}
