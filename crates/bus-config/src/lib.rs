//! bus-config: the key/value config provider the core delegates persistence
//! to (§1 "consumed via a key/value config provider").
//!
//! `config.json` (peer) and `account.json` (broker) are both flat JSON
//! objects; this crate treats them as untyped key/value stores and lets the
//! callers in `services/broker` and `services/peer` interpret the values.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading/writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} does not contain a JSON object")]
    NotAnObject { path: PathBuf },
    #[error("malformed JSON in {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn get(&self, key: &str) -> Option<Value>;
    async fn set(&self, key: &str, value: Value) -> Result<(), ConfigError>;
    async fn all(&self) -> BTreeMap<String, Value>;
}

/// A flat JSON-object-backed config file, read-copy-update under a mutex so
/// concurrent `set` calls never interleave writes (§5 "Shared-resource
/// policy").
pub struct JsonFileConfig {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileConfig {
    /// Load from `path`, creating an empty object file if it doesn't exist
    /// yet (matching the original's "if config doesn't exist, don't write
    /// until `save_config`" semantics, simplified to: an absent file reads
    /// as empty, the first `set` creates it).
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let cache = match tokio::fs::read_to_string(&path).await {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => {
                let value: Value =
                    serde_json::from_str(&text).map_err(|source| ConfigError::Malformed {
                        path: path.clone(),
                        source,
                    })?;
                match value {
                    Value::Object(map) => map.into_iter().collect(),
                    _ => return Err(ConfigError::NotAnObject { path }),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(JsonFileConfig {
            path,
            cache: Mutex::new(cache),
        })
    }

    async fn flush(&self, cache: &BTreeMap<String, Value>) -> Result<(), ConfigError> {
        let object: serde_json::Map<String, Value> = cache.clone().into_iter().collect();
        let text = serde_json::to_string_pretty(&Value::Object(object)).expect("map serializes");
        tokio::fs::write(&self.path, text)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

#[async_trait]
impl ConfigProvider for JsonFileConfig {
    async fn get(&self, key: &str) -> Option<Value> {
        self.cache.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut cache = self.cache.lock().await;
        cache.insert(key.to_owned(), value);
        self.flush(&cache).await
    }

    async fn all(&self) -> BTreeMap<String, Value> {
        self.cache.lock().await.clone()
    }
}

/// An in-memory provider for tests and for the "never persist" non-goal
/// edge case (a peer that chooses not to touch disk at all).
#[derive(Default)]
pub struct MemoryConfig {
    cache: Mutex<BTreeMap<String, Value>>,
}

impl MemoryConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigProvider for MemoryConfig {
    async fn get(&self, key: &str) -> Option<Value> {
        self.cache.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        self.cache.lock().await.insert(key.to_owned(), value);
        Ok(())
    }

    async fn all(&self) -> BTreeMap<String, Value> {
        self.cache.lock().await.clone()
    }
}
