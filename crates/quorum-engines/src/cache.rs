// crates/quorum-engines/src/cache.rs

//! Fingerprinted response cache with TTL and a streaming variant.
//!
//! Keys are SHA-256 digests over canonical JSON of
//! `(provider, model, stage, prompt, sorted options)`. The `stream` flag is
//! deliberately not part of the fingerprint, so a streamed call and a plain
//! call for the same inputs share one entry.

use log::debug;
use lru::LruCache;
use quorum_core::types::GenerationOptions;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Maximum number of entries held
    pub capacity: usize,
    pub default_ttl: Duration,
    /// How long an unfinished streaming entry may linger before eviction
    pub stream_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 1024,
            default_ttl: Duration::from_secs(3600),
            stream_grace: Duration::from_secs(30),
        }
    }
}

/// The inputs that define one cache slot.
#[derive(Debug, Clone)]
pub struct CacheKey {
    pub provider: String,
    pub model: String,
    pub stage: String,
    pub prompt: String,
    options: Vec<(String, Value)>,
}

impl CacheKey {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        stage: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            stage: stage.into(),
            prompt: prompt.into(),
            options: Vec::new(),
        }
    }

    /// Fold in the option fields that affect generated content.
    pub fn with_options(mut self, options: &GenerationOptions) -> Self {
        self.options = options.fingerprint_fields();
        self
    }

    /// Stable fingerprint: a readable `provider:model:stage:` prefix (which
    /// the prefix operations match on) followed by the canonical digest.
    pub fn fingerprint(&self) -> String {
        let sorted_options: BTreeMap<&str, &Value> =
            self.options.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let canonical = serde_json::json!({
            "model": self.model,
            "options": sorted_options,
            "prompt": self.prompt,
            "provider": self.provider,
            "stage": self.stage,
        });
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        format!("{}:{}:{}:{:x}", self.provider, self.model, self.stage, digest)
    }
}

#[derive(Debug, Clone)]
enum CacheValue {
    Full(String),
    Stream { chunks: Vec<String>, complete: bool },
}

/// Outcome of a read under the entries lock, resolved after the entry
/// borrow ends.
enum Lookup<T> {
    Hit(T),
    Evict,
    Miss,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Aggregate cache counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub evictions: u64,
    pub entries: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheShared {
    config: CacheConfig,
    entries: Mutex<LruCache<String, CacheEntry>>,
    stats: Mutex<CacheStats>,
}

/// In-memory response cache. Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct ResponseCache {
    shared: Arc<CacheShared>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            shared: Arc::new(CacheShared {
                config,
                entries: Mutex::new(LruCache::new(capacity)),
                stats: Mutex::new(CacheStats::default()),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Globally disabled cache: every lookup misses, every write is dropped.
    pub fn disabled() -> Self {
        Self::new(CacheConfig {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.config.enabled
    }

    /// Fetch the payload for a key, honouring TTL on read.
    ///
    /// Complete streaming entries are returned as their aggregated text;
    /// entries still being built are never returned and are evicted once
    /// their grace window passes.
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        self.get_by_fingerprint(&key.fingerprint())
    }

    pub fn get_by_fingerprint(&self, fingerprint: &str) -> Option<String> {
        if !self.shared.config.enabled {
            return None;
        }
        let mut entries = self.shared.entries.lock().ok()?;
        let lookup = match entries.get(fingerprint) {
            Some(entry) if entry.is_expired() => Lookup::Evict,
            Some(entry) => match &entry.value {
                CacheValue::Full(payload) => Lookup::Hit(payload.clone()),
                CacheValue::Stream { chunks, complete: true } => Lookup::Hit(chunks.concat()),
                CacheValue::Stream { complete: false, .. } => {
                    if entry.created_at.elapsed() > self.shared.config.stream_grace {
                        Lookup::Evict
                    } else {
                        Lookup::Miss
                    }
                }
            },
            None => Lookup::Miss,
        };
        match lookup {
            Lookup::Hit(payload) => {
                self.bump(|stats| stats.hits += 1);
                Some(payload)
            }
            Lookup::Evict => {
                entries.pop(fingerprint);
                self.bump(|stats| {
                    stats.evictions += 1;
                    stats.misses += 1;
                });
                None
            }
            Lookup::Miss => {
                self.bump(|stats| stats.misses += 1);
                None
            }
        }
    }

    pub fn set(&self, key: &CacheKey, payload: impl Into<String>) {
        self.set_with_ttl(key, payload, self.shared.config.default_ttl);
    }

    pub fn set_with_ttl(&self, key: &CacheKey, payload: impl Into<String>, ttl: Duration) {
        if !self.shared.config.enabled {
            return;
        }
        if let Ok(mut entries) = self.shared.entries.lock() {
            entries.put(
                key.fingerprint(),
                CacheEntry {
                    value: CacheValue::Full(payload.into()),
                    created_at: Instant::now(),
                    ttl,
                },
            );
            let count = entries.len();
            self.bump(|stats| {
                stats.insertions += 1;
                stats.entries = count;
            });
        }
    }

    pub fn delete(&self, key: &CacheKey) -> bool {
        self.shared
            .entries
            .lock()
            .map(|mut entries| entries.pop(&key.fingerprint()).is_some())
            .unwrap_or(false)
    }

    /// Whether any live entry's fingerprint starts with `prefix`.
    pub fn exists_by_prefix(&self, prefix: &str) -> bool {
        self.shared
            .entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .any(|(fingerprint, entry)| fingerprint.starts_with(prefix) && !entry.is_expired())
            })
            .unwrap_or(false)
    }

    /// Drop every entry whose fingerprint starts with `prefix`; returns the
    /// number removed.
    pub fn clear_prefix(&self, prefix: &str) -> usize {
        let Ok(mut entries) = self.shared.entries.lock() else {
            return 0;
        };
        let doomed: Vec<String> = entries
            .iter()
            .filter(|(fingerprint, _)| fingerprint.starts_with(prefix))
            .map(|(fingerprint, _)| fingerprint.clone())
            .collect();
        for fingerprint in &doomed {
            entries.pop(fingerprint);
        }
        let count = entries.len();
        self.bump(|stats| {
            stats.evictions += doomed.len() as u64;
            stats.entries = count;
        });
        doomed.len()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.shared.entries.lock() {
            let removed = entries.len() as u64;
            entries.clear();
            self.bump(|stats| {
                stats.evictions += removed;
                stats.entries = 0;
            });
        }
        debug!("response cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self
            .shared
            .stats
            .lock()
            .map(|stats| *stats)
            .unwrap_or_default();
        stats.entries = self
            .shared
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0);
        stats
    }

    /// Open a streaming entry for a key. Chunks pushed through the recorder
    /// become visible to readers only once `finish` marks the entry
    /// complete; an abandoned recorder leaves an incomplete entry that the
    /// grace window reaps.
    pub fn begin_stream(&self, key: &CacheKey) -> StreamRecorder {
        let fingerprint = key.fingerprint();
        if self.shared.config.enabled {
            if let Ok(mut entries) = self.shared.entries.lock() {
                entries.put(
                    fingerprint.clone(),
                    CacheEntry {
                        value: CacheValue::Stream {
                            chunks: Vec::new(),
                            complete: false,
                        },
                        created_at: Instant::now(),
                        ttl: self.shared.config.default_ttl,
                    },
                );
            }
        }
        StreamRecorder {
            shared: Arc::clone(&self.shared),
            fingerprint,
        }
    }

    /// Replay a complete streaming entry's chunks in original order.
    /// A plain entry replays as a single chunk.
    pub fn get_stream(&self, key: &CacheKey) -> Option<Vec<String>> {
        if !self.shared.config.enabled {
            return None;
        }
        let fingerprint = key.fingerprint();
        let mut entries = self.shared.entries.lock().ok()?;
        let lookup = match entries.get(&fingerprint) {
            Some(entry) if entry.is_expired() => Lookup::Evict,
            Some(entry) => match &entry.value {
                CacheValue::Full(payload) => Lookup::Hit(vec![payload.clone()]),
                CacheValue::Stream { chunks, complete: true } => Lookup::Hit(chunks.clone()),
                CacheValue::Stream { complete: false, .. } => Lookup::Miss,
            },
            None => Lookup::Miss,
        };
        match lookup {
            Lookup::Hit(chunks) => {
                self.bump(|stats| stats.hits += 1);
                Some(chunks)
            }
            Lookup::Evict => {
                entries.pop(&fingerprint);
                self.bump(|stats| {
                    stats.evictions += 1;
                    stats.misses += 1;
                });
                None
            }
            Lookup::Miss => {
                self.bump(|stats| stats.misses += 1);
                None
            }
        }
    }

    fn bump<F: FnOnce(&mut CacheStats)>(&self, update: F) {
        if let Ok(mut stats) = self.shared.stats.lock() {
            update(&mut stats);
        }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Incrementally records one stream into the cache.
pub struct StreamRecorder {
    shared: Arc<CacheShared>,
    fingerprint: String,
}

impl StreamRecorder {
    pub fn push(&self, chunk: &str) {
        if !self.shared.config.enabled {
            return;
        }
        if let Ok(mut entries) = self.shared.entries.lock() {
            if let Some(entry) = entries.get_mut(&self.fingerprint) {
                if let CacheValue::Stream { chunks, complete: false } = &mut entry.value {
                    chunks.push(chunk.to_string());
                }
            }
        }
    }

    /// Mark the entry complete, making it visible to readers.
    pub fn finish(self) {
        if !self.shared.config.enabled {
            return;
        }
        if let Ok(mut entries) = self.shared.entries.lock() {
            if let Some(entry) = entries.get_mut(&self.fingerprint) {
                if let CacheValue::Stream { complete, .. } = &mut entry.value {
                    *complete = true;
                }
                // The TTL clock starts when the stream closes.
                entry.created_at = Instant::now();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(prompt: &str) -> CacheKey {
        CacheKey::new("mock", "mA", "initial", prompt)
    }

    #[test]
    fn set_get_round_trip_before_ttl() {
        let cache = ResponseCache::with_defaults();
        cache.set(&key("q"), "answer");
        assert_eq!(cache.get(&key("q")).as_deref(), Some("answer"));
        assert_eq!(cache.get(&key("other")), None);
    }

    #[test]
    fn expired_entries_miss_and_evict() {
        let cache = ResponseCache::with_defaults();
        cache.set_with_ttl(&key("q"), "answer", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&key("q")), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn fingerprints_are_stable_and_option_sensitive() {
        let a = key("q").fingerprint();
        let b = key("q").fingerprint();
        assert_eq!(a, b);

        let options = GenerationOptions {
            max_tokens: Some(64),
            ..Default::default()
        };
        let with_options = key("q").with_options(&options).fingerprint();
        assert_ne!(a, with_options);

        // skip_cache and timeout are transport options, not content options.
        let transport_only = GenerationOptions {
            skip_cache: true,
            timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        assert_eq!(a, key("q").with_options(&transport_only).fingerprint());
    }

    #[test]
    fn prefix_operations() {
        let cache = ResponseCache::with_defaults();
        cache.set(&CacheKey::new("openai", "gpt-4o", "initial", "q"), "a");
        cache.set(&CacheKey::new("anthropic", "claude", "initial", "q"), "b");

        assert!(cache.exists_by_prefix("openai:"));
        assert!(!cache.exists_by_prefix("google:"));

        assert_eq!(cache.clear_prefix("openai:"), 1);
        assert!(!cache.exists_by_prefix("openai:"));
        assert!(cache.exists_by_prefix("anthropic:"));
    }

    #[test]
    fn delete_round_trip() {
        let cache = ResponseCache::with_defaults();
        cache.set(&key("q"), "a");
        assert!(cache.delete(&key("q")));
        assert!(!cache.delete(&key("q")));
        assert_eq!(cache.get(&key("q")), None);
    }

    #[test]
    fn disabled_cache_never_stores() {
        let cache = ResponseCache::disabled();
        cache.set(&key("q"), "a");
        assert_eq!(cache.get(&key("q")), None);
    }

    #[test]
    fn incomplete_streams_are_invisible() {
        let cache = ResponseCache::with_defaults();
        let recorder = cache.begin_stream(&key("q"));
        recorder.push("hel");
        recorder.push("lo");

        assert_eq!(cache.get(&key("q")), None);
        assert_eq!(cache.get_stream(&key("q")), None);

        recorder.finish();
        assert_eq!(cache.get_stream(&key("q")), Some(vec!["hel".to_string(), "lo".to_string()]));
        // Aggregated view matches the plain read path.
        assert_eq!(cache.get(&key("q")).as_deref(), Some("hello"));
    }

    #[test]
    fn abandoned_stream_evicted_after_grace() {
        let cache = ResponseCache::new(CacheConfig {
            stream_grace: Duration::from_millis(1),
            ..Default::default()
        });
        let recorder = cache.begin_stream(&key("q"));
        recorder.push("chunk");
        drop(recorder);

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&key("q")), None);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn plain_entry_replays_as_single_chunk() {
        let cache = ResponseCache::with_defaults();
        cache.set(&key("q"), "whole answer");
        assert_eq!(cache.get_stream(&key("q")), Some(vec!["whole answer".to_string()]));
    }

    #[test]
    fn stats_track_hits_and_misses() {
        let cache = ResponseCache::with_defaults();
        assert_eq!(cache.get(&key("q")), None);
        cache.set(&key("q"), "a");
        assert!(cache.get(&key("q")).is_some());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }
}
