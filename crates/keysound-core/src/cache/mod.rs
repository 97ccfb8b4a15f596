//! Content-addressed decode cache
//!
//! Keysounds are requested by key (usually a file path) but stored by the
//! BLAKE3 hash of their encoded bytes, so identical files under different
//! names share one decoded asset.
//!
//! # Layout
//!
//! ```text
//! category ──┬── keys:   key  → hash
//!            └── hashes: hash → DecodeCell (OnceLock<Result<asset>>)
//! ```
//!
//! # At-most-one decode
//!
//! The `DecodeCell` for a hash is registered under a short lock. Every caller
//! racing on the same content ends up with the same `Arc<DecodeCell>` and calls
//! `OnceLock::get_or_init`: exactly one of them runs the decode, the rest block
//! on the cell and read the published result. The decode itself never runs
//! under the map lock.
//!
//! Failed decodes are evicted (only if the cell is still the registered one),
//! so a later request retries.

mod empty;
mod source;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use basedrop::Shared;
use rayon::prelude::*;
use thiserror::Error;

use crate::asset::CachedAsset;
use crate::buffer::AlignedBuffer;
use crate::decode;
use crate::engine::gc::gc_handle;
use crate::types::WaveFormat;

pub use empty::{EMPTY_ASSET_KEY, EMPTY_WAV};
pub use source::ByteSource;

/// Category for regular keysounds
pub const DEFAULT_CATEGORY: &str = "default";

/// Category for sounds owned by the application itself
pub const INTERNAL_CATEGORY: &str = "internal";

/// Fatal cache errors (everything else degrades to `CacheStatus::Failed`)
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Audio memory allocation failed while decoding '{key}': {reason}")]
    Allocation { key: String, reason: String },
}

/// How a lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// An existing (or concurrently produced) asset was returned
    Hit,
    /// This call ran the decode
    Created,
    /// Reading or decoding failed
    Failed,
}

/// Result of a cache lookup
pub struct CacheResult {
    pub asset: Option<Shared<CachedAsset>>,
    pub status: CacheStatus,
}

impl CacheResult {
    fn hit(asset: Shared<CachedAsset>) -> Self {
        Self {
            asset: Some(asset),
            status: CacheStatus::Hit,
        }
    }

    fn failed() -> Self {
        Self {
            asset: None,
            status: CacheStatus::Failed,
        }
    }
}

impl std::fmt::Debug for CacheResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheResult")
            .field("hash", &self.asset.as_ref().map(|a| a.hash().to_string()))
            .field("status", &self.status)
            .finish()
    }
}

/// One entry of a parallel preload
#[derive(Debug)]
pub struct PreloadRequest {
    pub key: String,
    pub source: ByteSource,
    pub category: String,
}

impl PreloadRequest {
    pub fn new(key: impl Into<String>, source: impl Into<ByteSource>, category: &str) -> Self {
        Self {
            key: key.into(),
            source: source.into(),
            category: category.to_string(),
        }
    }
}

/// Counter snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub creates: u64,
    pub failures: u64,
}

#[derive(Default)]
struct StatCounters {
    hits: AtomicU64,
    creates: AtomicU64,
    failures: AtomicU64,
}

/// Decode result shared by every caller racing on one hash
type DecodeOutcome = Result<Shared<CachedAsset>, String>;

struct DecodeCell {
    outcome: OnceLock<DecodeOutcome>,
    /// Set when the owning category was cleared; the decoder disposes its
    /// own result if it finishes afterwards
    cleared: AtomicBool,
}

impl DecodeCell {
    fn new() -> Self {
        Self {
            outcome: OnceLock::new(),
            cleared: AtomicBool::new(false),
        }
    }

    fn resolved_asset(&self) -> Option<&Shared<CachedAsset>> {
        match self.outcome.get() {
            Some(Ok(asset)) => Some(asset),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Category {
    keys: HashMap<String, String>,
    hashes: HashMap<String, Arc<DecodeCell>>,
}

/// Concurrent, category-partitioned decode cache
pub struct CacheManager {
    format: WaveFormat,
    categories: Mutex<HashMap<String, Category>>,
    empty: OnceLock<Shared<CachedAsset>>,
    stats: StatCounters,
}

impl CacheManager {
    /// Create a cache storing assets in `format` (the engine format)
    pub fn new(format: WaveFormat) -> Self {
        Self {
            format,
            categories: Mutex::new(HashMap::new()),
            empty: OnceLock::new(),
            stats: StatCounters::default(),
        }
    }

    pub fn format(&self) -> WaveFormat {
        self.format
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Category>> {
        self.categories.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `key` to a decoded asset, decoding `source` if needed
    ///
    /// `Err` is only returned for allocation failure; every other problem is
    /// logged and reported as `CacheStatus::Failed`.
    pub fn try_get_or_create(
        &self,
        key: &str,
        source: impl Into<ByteSource>,
        category: &str,
    ) -> Result<CacheResult, CacheError> {
        // 1. Fast path: key already maps to a resolved asset
        if let Some(asset) = self.lookup(key, category) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("Cache hit for '{}' ({})", key, asset.hash());
            return Ok(CacheResult::hit(asset));
        }

        // 2. Read and hash
        let source = source.into();
        let hint = source.extension_hint();
        let bytes = match source.read_all() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to read keysound '{}': {}", key, e);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Ok(CacheResult::failed());
            }
        };
        let hash = blake3::hash(&bytes).to_hex().to_string();

        // 3 + 4. Record the key and join (or register) the decode for this hash
        let cell = {
            let mut categories = self.lock();
            let entry = categories.entry(category.to_string()).or_default();
            entry.keys.insert(key.to_string(), hash.clone());
            Arc::clone(
                entry
                    .hashes
                    .entry(hash.clone())
                    .or_insert_with(|| Arc::new(DecodeCell::new())),
            )
        };

        // 5. Run or await the decode
        let mut performed = false;
        let mut fatal = None;
        let outcome = cell.outcome.get_or_init(|| {
            performed = true;
            match decode::decode(bytes, self.format, hint.as_deref()) {
                Ok(buffer) => Ok(Shared::new(
                    &gc_handle(),
                    CachedAsset::new(hash.clone(), self.format, buffer),
                )),
                Err(e) => {
                    let reason = e.to_string();
                    if e.is_fatal() {
                        fatal = Some(reason.clone());
                    }
                    Err(reason)
                }
            }
        });

        match outcome {
            Ok(asset) => {
                if cell.cleared.load(Ordering::SeqCst) {
                    // The category was cleared while we were decoding
                    if performed {
                        if let Err(e) = asset.dispose() {
                            log::error!("{}", e);
                        }
                    }
                    self.stats.failures.fetch_add(1, Ordering::Relaxed);
                    return Ok(CacheResult::failed());
                }

                let status = if performed {
                    self.stats.creates.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Decoded '{}' → {} ({} bytes, {:.3}s)",
                        key,
                        hash,
                        asset.byte_len(),
                        asset.duration().as_secs_f64()
                    );
                    CacheStatus::Created
                } else {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    log::debug!("Cache hit for '{}' ({}) via content hash", key, hash);
                    CacheStatus::Hit
                };
                Ok(CacheResult {
                    asset: Some(asset.clone()),
                    status,
                })
            }
            Err(reason) => {
                self.evict(category, &hash, &cell);
                self.stats.failures.fetch_add(1, Ordering::Relaxed);

                if let Some(reason) = fatal {
                    log::error!("Allocation failed decoding '{}': {}", key, reason);
                    return Err(CacheError::Allocation {
                        key: key.to_string(),
                        reason,
                    });
                }
                log::warn!("Failed to decode keysound '{}': {}", key, reason);
                Ok(CacheResult::failed())
            }
        }
    }

    /// Like [`try_get_or_create`](Self::try_get_or_create), falling back to
    /// the canonical empty asset on failure
    pub fn get_or_create_or_empty(
        &self,
        key: &str,
        source: impl Into<ByteSource>,
        category: &str,
    ) -> Result<Shared<CachedAsset>, CacheError> {
        let result = self.try_get_or_create(key, source, category)?;
        Ok(result.asset.unwrap_or_else(|| self.empty_asset()))
    }

    /// Silent placeholder asset, decoded once at the engine format
    pub fn empty_asset(&self) -> Shared<CachedAsset> {
        self.empty
            .get_or_init(|| {
                let hash = blake3::hash(EMPTY_WAV).to_hex().to_string();
                let buffer = decode::decode(EMPTY_WAV.to_vec(), self.format, Some("wav"))
                    .unwrap_or_else(|e| {
                        log::warn!(
                            "Failed to decode {}: {}, using a zero-length asset",
                            EMPTY_ASSET_KEY,
                            e
                        );
                        AlignedBuffer::new()
                    });
                Shared::new(&gc_handle(), CachedAsset::new(hash, self.format, buffer))
            })
            .clone()
    }

    fn lookup(&self, key: &str, category: &str) -> Option<Shared<CachedAsset>> {
        let categories = self.lock();
        let entry = categories.get(category)?;
        let hash = entry.keys.get(key)?;
        entry.hashes.get(hash)?.resolved_asset().cloned()
    }

    fn evict(&self, category: &str, hash: &str, cell: &Arc<DecodeCell>) {
        let mut categories = self.lock();
        if let Some(entry) = categories.get_mut(category) {
            if entry
                .hashes
                .get(hash)
                .is_some_and(|current| Arc::ptr_eq(current, cell))
            {
                entry.hashes.remove(hash);
            }
        }
    }

    /// Whether `key` maps to a decoded asset in `category`
    pub fn contains_key(&self, key: &str, category: &str) -> bool {
        self.lookup(key, category).is_some()
    }

    /// Content hash recorded for `key`, if any
    pub fn hash_for_key(&self, key: &str, category: &str) -> Option<String> {
        self.lock().get(category)?.keys.get(key).cloned()
    }

    pub fn key_count(&self, category: &str) -> usize {
        self.lock().get(category).map_or(0, |c| c.keys.len())
    }

    pub fn hash_count(&self, category: &str) -> usize {
        self.lock().get(category).map_or(0, |c| c.hashes.len())
    }

    /// Names of all non-empty categories
    pub fn categories(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            creates: self.stats.creates.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
        }
    }

    /// Populate the cache in parallel on the rayon pool
    ///
    /// Returns one result per request, in request order.
    pub fn preload(&self, requests: Vec<PreloadRequest>) -> Vec<Result<CacheResult, CacheError>> {
        let count = requests.len();
        let results: Vec<_> = requests
            .into_par_iter()
            .map(|req| self.try_get_or_create(&req.key, req.source, &req.category))
            .collect();

        let created = results
            .iter()
            .filter(|r| matches!(r, Ok(CacheResult { status: CacheStatus::Created, .. })))
            .count();
        log::info!("Preloaded {} keysounds ({} decoded)", count, created);
        results
    }

    /// Dispose every asset in `category` and forget its keys
    ///
    /// Decodes still in flight dispose their result when they complete.
    /// Must not be called from the audio thread or while holding a guard on
    /// one of the category's assets.
    pub fn clear(&self, category: &str) {
        let removed = self.lock().remove(category);
        let Some(removed) = removed else {
            return;
        };

        let mut disposed = 0;
        for cell in removed.hashes.values() {
            cell.cleared.store(true, Ordering::SeqCst);
            if let Some(asset) = cell.resolved_asset() {
                match asset.dispose() {
                    Ok(()) => disposed += 1,
                    Err(e) => log::error!("{}", e),
                }
            }
        }

        log::info!(
            "Cleared cache category '{}': {} keys, {} assets disposed",
            category,
            removed.keys.len(),
            disposed
        );
    }

    /// Clear every category
    pub fn clear_all(&self) {
        for category in self.categories() {
            self.clear(&category);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{sine_wav, wav_bytes};
    use std::sync::Barrier;
    use std::thread;

    fn manager() -> CacheManager {
        CacheManager::new(WaveFormat::stereo16(44100))
    }

    #[test]
    fn test_same_content_under_two_keys() {
        let cache = manager();
        let bytes = sine_wav(44100, 2, 44100, 440.0, 0.5);

        let a = cache.try_get_or_create("a.wav", bytes.clone(), DEFAULT_CATEGORY).unwrap();
        let b = cache.try_get_or_create("b.wav", bytes, DEFAULT_CATEGORY).unwrap();

        assert_eq!(a.status, CacheStatus::Created);
        assert_eq!(b.status, CacheStatus::Hit);
        assert_eq!(cache.key_count(DEFAULT_CATEGORY), 2);
        assert_eq!(cache.hash_count(DEFAULT_CATEGORY), 1);

        let a = a.asset.unwrap();
        let b = b.asset.unwrap();
        assert!(std::ptr::eq(&*a, &*b));
        assert!((a.duration().as_secs_f64() - 1.0).abs() < 1e-3);
        assert_eq!(
            cache.hash_for_key("a.wav", DEFAULT_CATEGORY).as_deref(),
            Some(a.hash())
        );
    }

    #[test]
    fn test_repeat_key_is_hit() {
        let cache = manager();
        let bytes = sine_wav(44100, 2, 1000, 440.0, 0.5);

        cache.try_get_or_create("k", bytes.clone(), DEFAULT_CATEGORY).unwrap();
        let again = cache.try_get_or_create("k", bytes, DEFAULT_CATEGORY).unwrap();

        assert_eq!(again.status, CacheStatus::Hit);
        assert!(cache.contains_key("k", DEFAULT_CATEGORY));
        assert!(!cache.contains_key("k", INTERNAL_CATEGORY));
        assert_eq!(cache.stats(), CacheStats { hits: 1, creates: 1, failures: 0 });
    }

    #[test]
    fn test_concurrent_requests_decode_once() {
        const THREADS: usize = 8;
        let cache = Arc::new(manager());
        let bytes = sine_wav(22050, 1, 22050, 330.0, 0.4);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let bytes = bytes.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let result = cache
                        .try_get_or_create(&format!("key-{}", i), bytes, DEFAULT_CATEGORY)
                        .unwrap();
                    let hash = result.asset.as_ref().unwrap().hash().to_string();
                    (result.status, hash)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let created = results.iter().filter(|(s, _)| *s == CacheStatus::Created).count();
        let hits = results.iter().filter(|(s, _)| *s == CacheStatus::Hit).count();
        assert_eq!(created, 1);
        assert_eq!(hits, THREADS - 1);
        assert!(results.iter().all(|(_, h)| *h == results[0].1));
        assert_eq!(cache.hash_count(DEFAULT_CATEGORY), 1);
        assert_eq!(cache.key_count(DEFAULT_CATEGORY), THREADS);
    }

    #[test]
    fn test_failed_decode_is_evicted_and_retried() {
        let cache = manager();
        let garbage = vec![0x13u8; 512];

        let first = cache.try_get_or_create("bad", garbage.clone(), DEFAULT_CATEGORY).unwrap();
        assert_eq!(first.status, CacheStatus::Failed);
        assert!(first.asset.is_none());
        assert_eq!(cache.hash_count(DEFAULT_CATEGORY), 0);

        let second = cache.try_get_or_create("bad", garbage, DEFAULT_CATEGORY).unwrap();
        assert_eq!(second.status, CacheStatus::Failed);
        assert_eq!(cache.stats().failures, 2);
    }

    #[test]
    fn test_missing_file_falls_back_to_empty() {
        let cache = manager();
        let missing = std::path::Path::new("/nonexistent/kick.wav");
        let asset = cache
            .get_or_create_or_empty("missing", missing, DEFAULT_CATEGORY)
            .unwrap();

        let empty = cache.empty_asset();
        assert!(std::ptr::eq(&*asset, &*empty));
        assert!(asset.try_acquire_samples().unwrap().iter().all(|&s| s == 0));
    }

    #[test]
    fn test_clear_disposes_category() {
        let cache = manager();
        let result = cache
            .try_get_or_create("snare", sine_wav(44100, 2, 500, 200.0, 0.3), DEFAULT_CATEGORY)
            .unwrap();
        let held = result.asset.unwrap();

        cache
            .try_get_or_create("click", sine_wav(44100, 2, 500, 900.0, 0.3), INTERNAL_CATEGORY)
            .unwrap();

        cache.clear(DEFAULT_CATEGORY);

        assert!(held.is_disposed());
        assert!(held.try_acquire_samples().is_none());
        assert_eq!(cache.key_count(DEFAULT_CATEGORY), 0);
        assert!(cache.contains_key("click", INTERNAL_CATEGORY));
        assert_eq!(cache.categories(), vec![INTERNAL_CATEGORY.to_string()]);

        cache.clear_all();
        assert!(cache.categories().is_empty());
    }

    #[test]
    fn test_clear_during_decode_disposes_late_result() {
        // 10 s at 44.1 kHz into a 48 kHz cache: a long resampling decode
        let cache = CacheManager::new(WaveFormat::stereo16(48000));
        let bytes = sine_wav(44100, 2, 441_000, 330.0, 0.4);

        let late = thread::scope(|s| {
            let worker = s.spawn(|| {
                cache
                    .try_get_or_create("long", bytes.clone(), DEFAULT_CATEGORY)
                    .unwrap()
            });

            // The cell is registered before the decode starts
            while cache.hash_count(DEFAULT_CATEGORY) == 0 {
                thread::sleep(std::time::Duration::from_millis(1));
            }
            cache.clear(DEFAULT_CATEGORY);
            worker.join().unwrap()
        });

        assert_eq!(late.status, CacheStatus::Failed);
        assert!(late.asset.is_none());
        assert_eq!(cache.hash_count(DEFAULT_CATEGORY), 0);
        assert_eq!(cache.stats().failures, 1);

        let retry = cache.try_get_or_create("long", bytes, DEFAULT_CATEGORY).unwrap();
        assert_eq!(retry.status, CacheStatus::Created);
        assert!(!retry.asset.unwrap().is_disposed());
    }

    #[test]
    fn test_path_source_uses_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hat.wav");
        std::fs::write(&path, wav_bytes(44100, 2, 64, |f, _| f as i16)).unwrap();

        let cache = manager();
        let result = cache.try_get_or_create("hat", path.as_path(), DEFAULT_CATEGORY).unwrap();

        assert_eq!(result.status, CacheStatus::Created);
        let asset = result.asset.unwrap();
        assert_eq!(asset.frame_count(), 64);
    }

    #[test]
    fn test_preload_in_parallel() {
        let cache = manager();
        let requests = (0..6)
            .map(|i| {
                PreloadRequest::new(
                    format!("tone-{}", i),
                    sine_wav(44100, 2, 2000, 100.0 * (i + 1) as f32, 0.5),
                    DEFAULT_CATEGORY,
                )
            })
            .collect();

        let results = cache.preload(requests);
        assert_eq!(results.len(), 6);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(CacheResult { status: CacheStatus::Created, .. }))));
        assert_eq!(cache.hash_count(DEFAULT_CATEGORY), 6);
    }
}
