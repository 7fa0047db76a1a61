//! Content-addressed cache of rendered artifacts.
//!
//! Artifacts are keyed by the hash of the input bytes and the hash of the
//! output-affecting settings. Metadata lives in `index.json` next to the
//! stored objects and is rewritten on every mutation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use render_media::fs_utils::{copy_file, remove_if_exists};
use render_media::MediaError;

use crate::metrics;

const INDEX_FILE: &str = "index.json";
const OBJECTS_DIR: &str = "objects";
const HASH_LEN: usize = 16;
const READ_CHUNK: usize = 64 * 1024;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache index error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cache copy failed: {0}")]
    Media(#[from] MediaError),

    #[error("Artifact of {size_bytes} bytes exceeds the cache ceiling of {max_bytes} bytes")]
    TooLarge { size_bytes: u64, max_bytes: u64 },
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Entries older than this are misses and get evicted.
    pub max_age: Duration,
    /// Size ceiling for all stored artifacts.
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/tmp/render/cache"),
            max_age: Duration::from_secs(7 * 24 * 3600),
            max_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            dir: std::env::var("RENDER_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dir),
            max_age: std::env::var("RENDER_CACHE_MAX_AGE_DAYS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|days| Duration::from_secs(days * 24 * 3600))
                .unwrap_or(defaults.max_age),
            max_bytes: std::env::var("RENDER_CACHE_MAX_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_bytes),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    pub key: String,
    pub input_hash: String,
    pub settings_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub input_hash: String,
    pub settings_hash: String,
    /// Object file name under the objects directory.
    pub file_name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// Render time that produced the artifact.
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Default)]
struct CacheState {
    entries: BTreeMap<String, CacheEntry>,
    total_bytes: u64,
    hits: u64,
    misses: u64,
}

pub struct RenderingCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl RenderingCache {
    /// Open the cache directory, loading an existing index if there is one.
    pub async fn open(config: CacheConfig) -> CacheResult<Self> {
        fs::create_dir_all(config.dir.join(OBJECTS_DIR)).await?;

        let entries = match fs::read(config.dir.join(INDEX_FILE)).await {
            Ok(raw) => match serde_json::from_slice::<BTreeMap<String, CacheEntry>>(&raw) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cache index is corrupt, starting empty: {}", e);
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let total_bytes = entries.values().map(|e| e.size_bytes).sum();
        info!(
            dir = %config.dir.display(),
            entries = entries.len(),
            total_bytes,
            "Render cache opened"
        );

        Ok(Self {
            config,
            state: Mutex::new(CacheState {
                entries,
                total_bytes,
                ..Default::default()
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Derive the cache key for an input file and its output-affecting settings.
    pub async fn generate_key(&self, input: &Path, settings: &Value) -> CacheResult<CacheKey> {
        let input_hash = hash_file(input).await?;
        let settings_hash = hash_settings(settings);
        Ok(CacheKey {
            key: format!("{}_{}", input_hash, settings_hash),
            input_hash,
            settings_hash,
        })
    }

    /// Path of a fresh cached artifact, or `None` on a miss.
    pub async fn get(&self, key: &str) -> CacheResult<Option<PathBuf>> {
        let mut state = self.state.lock().await;

        let Some(entry) = state.entries.get(key).cloned() else {
            state.misses += 1;
            metrics::record_cache_miss();
            return Ok(None);
        };

        let path = self.object_path(&entry.file_name);
        let present = fs::try_exists(&path).await.unwrap_or(false);
        if !present || self.is_stale(&entry, Utc::now()) {
            debug!(key, present, "Evicting unusable cache entry");
            self.evict_locked(&mut state, key).await?;
            self.persist_locked(&state).await?;
            state.misses += 1;
            metrics::record_cache_miss();
            metrics::record_cache_evictions(1);
            return Ok(None);
        }

        state.hits += 1;
        metrics::record_cache_hit();
        Ok(Some(path))
    }

    /// Copy an artifact into the cache under `key`. Artifacts larger than the
    /// whole cache are rejected and leave any existing entry in place.
    pub async fn set(&self, key: &CacheKey, artifact: &Path, duration_ms: u64) -> CacheResult<PathBuf> {
        let size_bytes = fs::metadata(artifact).await?.len();
        if size_bytes > self.config.max_bytes {
            return Err(CacheError::TooLarge {
                size_bytes,
                max_bytes: self.config.max_bytes,
            });
        }

        let file_name = match artifact.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{}", key.key, ext),
            None => key.key.clone(),
        };
        let path = self.object_path(&file_name);

        let mut state = self.state.lock().await;
        let size_bytes = copy_file(artifact, &path).await?;

        if let Some(previous) = state.entries.remove(&key.key) {
            state.total_bytes = state.total_bytes.saturating_sub(previous.size_bytes);
            if previous.file_name != file_name {
                remove_if_exists(self.object_path(&previous.file_name)).await?;
            }
        }

        state.entries.insert(
            key.key.clone(),
            CacheEntry {
                key: key.key.clone(),
                input_hash: key.input_hash.clone(),
                settings_hash: key.settings_hash.clone(),
                file_name,
                size_bytes,
                created_at: Utc::now(),
                duration_ms,
            },
        );
        state.total_bytes += size_bytes;
        debug!(key = %key.key, size_bytes, "Cached render artifact");

        if state.total_bytes > self.config.max_bytes {
            let evicted = self.cleanup_locked(&mut state).await?;
            metrics::record_cache_evictions(evicted);
        }
        self.persist_locked(&state).await?;
        Ok(path)
    }

    /// Remove one entry. Returns false when the key was unknown.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut state = self.state.lock().await;
        let removed = self.evict_locked(&mut state, key).await?;
        if removed {
            self.persist_locked(&state).await?;
        }
        Ok(removed)
    }

    /// Evict stale entries, then the oldest ones until under the size ceiling.
    /// Returns the number of evicted entries.
    pub async fn cleanup(&self) -> CacheResult<usize> {
        let mut state = self.state.lock().await;
        let evicted = self.cleanup_locked(&mut state).await?;
        if evicted > 0 {
            self.persist_locked(&state).await?;
            metrics::record_cache_evictions(evicted);
        }
        Ok(evicted)
    }

    pub async fn clear(&self) -> CacheResult<usize> {
        let mut state = self.state.lock().await;
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            self.evict_locked(&mut state, key).await?;
        }
        self.persist_locked(&state).await?;
        info!(evicted = keys.len(), "Render cache cleared");
        Ok(keys.len())
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }

    fn object_path(&self, file_name: &str) -> PathBuf {
        self.config.dir.join(OBJECTS_DIR).join(file_name)
    }

    fn is_stale(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let age = (now - entry.created_at).to_std().unwrap_or(Duration::ZERO);
        age > self.config.max_age
    }

    async fn evict_locked(&self, state: &mut CacheState, key: &str) -> CacheResult<bool> {
        let Some(entry) = state.entries.remove(key) else {
            return Ok(false);
        };
        state.total_bytes = state.total_bytes.saturating_sub(entry.size_bytes);
        remove_if_exists(self.object_path(&entry.file_name)).await?;
        Ok(true)
    }

    async fn cleanup_locked(&self, state: &mut CacheState) -> CacheResult<usize> {
        let now = Utc::now();
        let stale: Vec<String> = state
            .entries
            .values()
            .filter(|e| self.is_stale(e, now))
            .map(|e| e.key.clone())
            .collect();

        let mut evicted = 0;
        for key in &stale {
            if self.evict_locked(state, key).await? {
                evicted += 1;
            }
        }

        if state.total_bytes > self.config.max_bytes {
            let mut by_age: Vec<(DateTime<Utc>, String)> = state
                .entries
                .values()
                .map(|e| (e.created_at, e.key.clone()))
                .collect();
            by_age.sort();

            for (_, key) in by_age {
                if state.total_bytes <= self.config.max_bytes {
                    break;
                }
                if self.evict_locked(state, &key).await? {
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            info!(evicted, total_bytes = state.total_bytes, "Render cache cleanup");
        }
        Ok(evicted)
    }

    async fn persist_locked(&self, state: &CacheState) -> CacheResult<()> {
        let index = self.config.dir.join(INDEX_FILE);
        let tmp = self
            .config
            .dir
            .join(format!(".{}.{}", INDEX_FILE, uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, serde_json::to_vec_pretty(&state.entries)?).await?;
        if let Err(e) = fs::rename(&tmp, &index).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    #[cfg(test)]
    async fn backdate(&self, key: &str, by: chrono::Duration) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(key) {
            entry.created_at -= by;
        }
    }
}

async fn hash_file(path: &Path) -> CacheResult<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(truncated_hex(&hasher.finalize()))
}

fn hash_settings(settings: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(settings, &mut canonical);
    truncated_hex(&Sha256::digest(canonical.as_bytes()))
}

/// JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn truncated_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .take(HASH_LEN / 2)
        .map(|b| format!("{:02x}", b))
        .collect()
}
