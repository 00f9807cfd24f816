//! The broker's `accounts: ServerId -> Key` map (§3 "Account"), persisted
//! through a [`ConfigProvider`] keyed by the `ServerId` text itself — each
//! entry in `account.json` is `"<ServerId>": "<key text>"`.

use bus_codec::Key;
use bus_config::ConfigProvider;
use bus_protocol::ServerId;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 5;

pub struct AccountStore {
    config: Arc<dyn ConfigProvider>,
    accounts: RwLock<HashMap<ServerId, Key>>,
}

impl AccountStore {
    /// Load every entry from `config` into memory. Keys that fail to parse
    /// as a fernet key are skipped with a warning — a corrupted account.json
    /// entry should not prevent the rest of the accounts from loading.
    pub async fn load(config: Arc<dyn ConfigProvider>) -> Self {
        let mut accounts = HashMap::new();
        for (id, value) in config.all().await {
            let Some(text) = value.as_str() else {
                tracing::warn!(account = %id, "account.json entry is not a string, skipping");
                continue;
            };
            match Key::from_text(text) {
                Ok(key) => {
                    accounts.insert(ServerId::from(id), key);
                }
                Err(e) => {
                    tracing::warn!(account = %id, error = %e, "invalid key in account.json, skipping");
                }
            }
        }
        AccountStore {
            config,
            accounts: RwLock::new(accounts),
        }
    }

    pub async fn contains(&self, id: &ServerId) -> bool {
        self.accounts.read().await.contains_key(id)
    }

    pub async fn key_for(&self, id: &ServerId) -> Option<Key> {
        self.accounts.read().await.get(id).cloned()
    }

    /// Generate a fresh 5-character alphanumeric id unique against the
    /// current in-memory map, mint a key, persist, and return the pair.
    pub async fn register_new(&self) -> Result<(ServerId, Key), bus_config::ConfigError> {
        let mut accounts = self.accounts.write().await;
        let id = loop {
            let candidate = random_id();
            if !accounts.contains_key(&candidate) {
                break candidate;
            }
        };
        let key = Key::generate();
        self.config.set(id.as_str(), serde_json::json!(key.as_text())).await?;
        accounts.insert(id.clone(), key.clone());
        Ok((id, key))
    }
}

fn random_id() -> ServerId {
    let mut rng = rand::thread_rng();
    let text: String = (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    ServerId::from(text)
}
