//! In-memory cache over the `system_config` table with optional encryption
//! and periodic hot reload.
//!
//! One instance per process, shared as `Arc<ConfigCache>`. Readers get the
//! current immutable snapshot; `set`, `delete` and the reload swap are
//! serialized by a single async mutex so a reload can never resurrect a
//! value that a concurrent `set` already replaced.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::Cipher;
use crate::store::{ConfigRepository, StoreError};

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

/// Placeholder shown instead of encrypted values in listings.
pub const MASKED_VALUE: &str = "*** ENCRYPTED ***";

const HOT_RELOAD_KEY: &str = "hot_reload_enabled";

/// A decoded configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Arrays, objects and `null`.
    Structured(Value),
}

impl ConfigValue {
    /// Decode a stored string: JSON if it parses, otherwise the raw text.
    pub fn decode(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => Self::from_json(value),
            Err(_) => ConfigValue::String(raw.to_string()),
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => ConfigValue::Bool(b),
            Value::Number(n) => ConfigValue::Number(n),
            Value::String(s) => ConfigValue::String(s),
            other => ConfigValue::Structured(other),
        }
    }

    /// Encode for storage so that `decode(encode(v)) == v`.
    ///
    /// Plain strings are stored as-is; strings that would decode as some
    /// other JSON value (`"42"`, `"true"`) are stored JSON-quoted.
    pub fn encode(&self) -> String {
        match self {
            ConfigValue::String(s) => match Self::decode(s) {
                ConfigValue::String(ref back) if back == s => s.clone(),
                _ => Value::String(s.clone()).to_string(),
            },
            ConfigValue::Bool(b) => b.to_string(),
            ConfigValue::Number(n) => n.to_string(),
            ConfigValue::Structured(v) => v.to_string(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ConfigValue::Bool(b) => Value::Bool(*b),
            ConfigValue::Number(n) => Value::Number(n.clone()),
            ConfigValue::String(s) => Value::String(s.clone()),
            ConfigValue::Structured(v) => v.clone(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Number(value.into())
    }
}

impl From<Value> for ConfigValue {
    fn from(value: Value) -> Self {
        ConfigValue::from_json(value)
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::String(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// One configuration row as shown to administrators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntryInfo {
    pub key: String,
    pub value: Option<ConfigValue>,
    pub description: Option<String>,
    pub is_encrypted: bool,
    pub updated_at: String,
}

struct Snapshot {
    values: Arc<HashMap<String, ConfigValue>>,
    loaded_at: Option<Instant>,
}

struct ReloadTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct ConfigCache {
    repo: Arc<dyn ConfigRepository>,
    cipher: Cipher,
    interval: Duration,
    snapshot: RwLock<Snapshot>,
    /// Serializes store writes with the reload swap.
    write_lock: Mutex<()>,
    reloader: Mutex<Option<ReloadTask>>,
    reloads: AtomicU64,
}

impl ConfigCache {
    pub fn new(repo: Arc<dyn ConfigRepository>, cipher: Cipher) -> Self {
        Self::with_interval(repo, cipher, DEFAULT_RELOAD_INTERVAL)
    }

    pub fn with_interval(repo: Arc<dyn ConfigRepository>, cipher: Cipher, interval: Duration) -> Self {
        Self {
            repo,
            cipher,
            interval,
            snapshot: RwLock::new(Snapshot {
                values: Arc::new(HashMap::new()),
                loaded_at: None,
            }),
            write_lock: Mutex::new(()),
            reloader: Mutex::new(None),
            reloads: AtomicU64::new(0),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of completed reloads since construction.
    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    fn current(&self) -> Arc<HashMap<String, ConfigValue>> {
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&snap.values)
    }

    fn needs_reload(&self) -> bool {
        let snap = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
        match snap.loaded_at {
            None => true,
            Some(at) => snap.values.is_empty() || at.elapsed() > self.interval,
        }
    }

    /// Reload synchronously if the cache is empty or older than the interval.
    async fn refresh_if_stale(&self) {
        if !self.needs_reload() {
            return;
        }
        let _guard = self.write_lock.lock().await;
        if !self.needs_reload() {
            return;
        }
        if let Err(e) = self.reload_locked().await {
            warn!("Config reload failed, serving cached values: {}", e);
        }
    }

    /// Cached value for `key`, or `None`.
    pub async fn get_opt(&self, key: &str) -> Option<ConfigValue> {
        self.refresh_if_stale().await;
        self.current().get(key).cloned()
    }

    /// Cached value for `key`, or `default` when absent. Never fails.
    pub async fn get(&self, key: &str, default: impl Into<ConfigValue>) -> ConfigValue {
        match self.get_opt(key).await {
            Some(value) => value,
            None => default.into(),
        }
    }

    /// Copy of every cached value.
    pub async fn get_all(&self) -> HashMap<String, ConfigValue> {
        self.refresh_if_stale().await;
        self.current().as_ref().clone()
    }

    /// Persist `value` (encrypted if requested), then cache it.
    ///
    /// Returns `false` and leaves the cache untouched if the value cannot be
    /// encrypted or stored.
    pub async fn set(
        &self,
        key: &str,
        value: impl Into<ConfigValue>,
        description: Option<&str>,
        encrypt: bool,
    ) -> bool {
        let value = value.into();
        let mut stored = value.encode();
        if encrypt {
            stored = match self.cipher.encrypt(&stored) {
                Ok(ciphertext) => ciphertext,
                Err(e) => {
                    error!("Failed to encrypt configuration {}: {}", key, e);
                    return false;
                }
            };
        }

        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.repo.upsert(key, &stored, description, encrypt).await {
            error!("Error setting configuration {}: {}", key, e);
            return false;
        }

        let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        Arc::make_mut(&mut snap.values).insert(key.to_string(), value);
        debug!("Configuration {} updated (encrypted: {})", key, encrypt);
        true
    }

    /// Remove `key` from the store and the cache. `false` if it did not
    /// exist or the store write failed.
    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.write_lock.lock().await;
        match self.repo.remove(key).await {
            Ok(true) => {
                let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
                Arc::make_mut(&mut snap.values).remove(key);
                debug!("Configuration {} deleted", key);
                true
            }
            Ok(false) => false,
            Err(e) => {
                error!("Error deleting configuration {}: {}", key, e);
                false
            }
        }
    }

    /// Rebuild the cache from the store and swap it in.
    ///
    /// Returns the number of cached keys. On error the previous snapshot is
    /// kept unchanged.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.reload_locked().await
    }

    /// Caller must hold `write_lock`.
    async fn reload_locked(&self) -> Result<usize, StoreError> {
        let rows = self.repo.load_all().await?;
        let previous = self.current();

        let mut next = HashMap::with_capacity(rows.len());
        for row in rows {
            let Some(raw) = row.value else {
                next.insert(row.key, ConfigValue::Structured(Value::Null));
                continue;
            };
            let plaintext = if row.is_encrypted {
                match self.cipher.decrypt(&raw) {
                    Ok(plain) => plain,
                    Err(e) => {
                        warn!("Failed to decrypt config {}: {}", row.key, e);
                        if let Some(old) = previous.get(&row.key) {
                            next.insert(row.key.clone(), old.clone());
                        }
                        continue;
                    }
                }
            } else {
                raw
            };
            next.insert(row.key, ConfigValue::decode(&plaintext));
        }

        let count = next.len();
        {
            let mut snap = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
            snap.values = Arc::new(next);
            snap.loaded_at = Some(Instant::now());
        }
        self.reloads.fetch_add(1, Ordering::SeqCst);
        debug!("Configuration reloaded ({} keys)", count);
        Ok(count)
    }

    /// Stored rows for display, with encrypted values masked.
    pub async fn entries(&self) -> Result<Vec<ConfigEntryInfo>, StoreError> {
        let rows = self.repo.load_all().await?;
        Ok(rows
            .into_iter()
            .map(|row| ConfigEntryInfo {
                value: if row.is_encrypted {
                    Some(ConfigValue::String(MASKED_VALUE.to_string()))
                } else {
                    row.value.as_deref().map(ConfigValue::decode)
                },
                key: row.key,
                description: row.description,
                is_encrypted: row.is_encrypted,
                updated_at: row.updated_at,
            })
            .collect())
    }

    /// One stored row with its decrypted, cached value.
    pub async fn entry(&self, key: &str) -> Result<Option<ConfigEntryInfo>, StoreError> {
        let rows = self.repo.load_all().await?;
        let Some(row) = rows.into_iter().find(|r| r.key == key) else {
            return Ok(None);
        };
        let value = self.get_opt(key).await;
        Ok(Some(ConfigEntryInfo {
            key: row.key,
            value,
            description: row.description,
            is_encrypted: row.is_encrypted,
            updated_at: row.updated_at,
        }))
    }

    /// Reads `hot_reload_enabled`, defaulting to enabled.
    pub async fn is_hot_reload_enabled(&self) -> bool {
        match self.get(HOT_RELOAD_KEY, true).await {
            ConfigValue::Bool(b) => b,
            other => other.to_string().eq_ignore_ascii_case("true"),
        }
    }

    /// Start the background reload task. Returns `false` if it is already
    /// running.
    pub async fn start_hot_reload(self: &Arc<Self>) -> bool {
        let mut slot = self.reloader.lock().await;
        if slot.as_ref().is_some_and(|task| !task.handle.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reload_loop(
            Arc::downgrade(self),
            cancel.clone(),
            self.interval,
        ));
        *slot = Some(ReloadTask { cancel, handle });
        info!("Hot reload configuration system started (interval {:?})", self.interval);
        true
    }

    /// Stop the background task and wait for it to exit. Returns `false` if
    /// it was not running.
    pub async fn stop_hot_reload(&self) -> bool {
        let task = self.reloader.lock().await.take();
        let Some(task) = task else {
            return false;
        };
        task.cancel.cancel();
        if let Err(e) = task.handle.await {
            error!("Config reload task ended abnormally: {}", e);
        }
        info!("Hot reload configuration system stopped");
        true
    }

    pub async fn is_hot_reload_running(&self) -> bool {
        self.reloader
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

async fn reload_loop(cache: Weak<ConfigCache>, cancel: CancellationToken, interval: Duration) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some(strong) = cache.upgrade() else {
            break;
        };
        if let Err(e) = strong.reload().await {
            error!("Error in config reload loop: {}", e);
        }
        drop(strong);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("Config reload loop exited");
}
