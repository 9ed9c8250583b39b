//! Content-addressed page cache with block-indexed invalidation.
//!
//! Rendered pages live on disk as `<key>.html`; the index (sizes, access
//! times, block dependencies) lives in memory behind one reader/writer lock.
//! File IO always happens outside the lock. The cache is invalidation-based
//! only: the merger publishes the block ids touched by a commit and every
//! page depending on one of them is dropped.

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Derive the cache key for a page: the first 16 hex characters of
/// SHA-256 over the path and its name-sorted parameters.
pub fn page_key(path: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    for (k, v) in sorted {
        hasher.update(k.as_bytes());
        hasher.update(v.as_bytes());
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

struct EntryMeta {
    size: u64,
    created_at: Instant,
    depends_on: Vec<String>,
}

struct Inner {
    entries: HashMap<String, EntryMeta>,
    /// Reverse index: block id -> keys of pages depending on it
    by_block: HashMap<String, HashSet<String>>,
    /// LRU order, least recently used at the front
    lru: VecDeque<String>,
    total_bytes: u64,
}

impl Inner {
    /// Detach an entry from the index; the caller deletes the file.
    fn detach(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.entries.remove(key)?;
        self.total_bytes -= meta.size;
        for block in &meta.depends_on {
            if let Some(keys) = self.by_block.get_mut(block) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_block.remove(block);
                }
            }
        }
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        Some(meta)
    }

    fn promote(&mut self, key: &str) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.to_string());
    }
}

/// Point-in-time cache statistics. Hit/miss/eviction counters are
/// monotone for the life of the process.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub size_bytes: u64,
}

pub struct PageCache {
    dir: PathBuf,
    max_bytes: u64,
    ttl: Duration,
    enabled: bool,
    inner: RwLock<Inner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl PageCache {
    /// Create a cache rooted at `dir`. Stale page files from a previous
    /// process carry no dependency metadata, so they are removed up front.
    pub fn new(dir: impl Into<PathBuf>, max_size_mb: u64, ttl: Duration, enabled: bool) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut removed = 0usize;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.path().extension().and_then(|e| e.to_str()) == Some("html") {
                std::fs::remove_file(entry.path()).ok();
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("Cleared {removed} stale cache files from {}", dir.display());
        }

        Ok(Self {
            dir,
            max_bytes: max_size_mb * 1024 * 1024,
            ttl,
            enabled,
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                by_block: HashMap::new(),
                lru: VecDeque::new(),
                total_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.html"))
    }

    /// Fetch a page, honoring TTL and bumping its recency.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.enabled {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let expired = {
            let mut inner = self.inner.write();
            let state = inner
                .entries
                .get(key)
                .map(|meta| meta.created_at.elapsed() > self.ttl);
            match state {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(true) => {
                    inner.detach(key);
                    true
                }
                Some(false) => {
                    inner.promote(key);
                    false
                }
            }
        };

        if expired {
            std::fs::remove_file(self.file_path(key)).ok();
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        match std::fs::read(self.file_path(key)) {
            Ok(bytes) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            Err(e) => {
                // The file vanished underneath us; drop the index entry.
                warn!("Cache file for {key} unreadable: {e}");
                self.inner.write().detach(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a page with its block dependencies, evicting least-recently
    /// used entries until the size budget fits.
    pub fn set(&self, key: &str, bytes: &[u8], depends_on_blocks: &[String]) -> std::io::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.file_path(key);
        let tmp = self.dir.join(format!("{key}.tmp"));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;

        let evicted: Vec<String> = {
            let mut inner = self.inner.write();
            // Replacing an existing entry must not double-count its size.
            inner.detach(key);

            inner.entries.insert(
                key.to_string(),
                EntryMeta {
                    size: bytes.len() as u64,
                    created_at: Instant::now(),
                    depends_on: depends_on_blocks.to_vec(),
                },
            );
            inner.total_bytes += bytes.len() as u64;
            inner.lru.push_back(key.to_string());
            for block in depends_on_blocks {
                inner
                    .by_block
                    .entry(block.clone())
                    .or_default()
                    .insert(key.to_string());
            }

            let mut evicted = Vec::new();
            while inner.total_bytes > self.max_bytes {
                let victim = match inner.lru.front().cloned() {
                    // Never evict the entry just written.
                    Some(k) if k != key => k,
                    _ => break,
                };
                inner.detach(&victim);
                evicted.push(victim);
            }
            evicted
        };

        for key in &evicted {
            std::fs::remove_file(self.file_path(key)).ok();
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Drop every page depending on a block. Returns how many pages went.
    pub fn invalidate_block(&self, block_id: &str) -> usize {
        let keys: Vec<String> = {
            let mut inner = self.inner.write();
            let keys: Vec<String> = inner
                .by_block
                .get(block_id)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default();
            for key in &keys {
                inner.detach(key);
            }
            keys
        };

        for key in &keys {
            std::fs::remove_file(self.file_path(key)).ok();
        }
        let n = keys.len();
        if n > 0 {
            self.invalidations.fetch_add(n as u64, Ordering::Relaxed);
            debug!("Invalidated {n} cached pages for block {block_id}");
        }
        n
    }

    /// Invalidate for a whole set of blocks (one merge's worth).
    pub fn invalidate_blocks<I, S>(&self, block_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        block_ids
            .into_iter()
            .map(|id| self.invalidate_block(id.as_ref()))
            .sum()
    }

    /// Drop everything.
    pub fn clear(&self) {
        let keys: Vec<String> = {
            let mut inner = self.inner.write();
            let keys: Vec<String> = inner.entries.keys().cloned().collect();
            inner.entries.clear();
            inner.by_block.clear();
            inner.lru.clear();
            inner.total_bytes = 0;
            keys
        };
        for key in &keys {
            std::fs::remove_file(self.file_path(key)).ok();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            size_bytes: inner.total_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(max_mb: u64) -> (PageCache, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = PageCache::new(dir.path(), max_mb, Duration::from_secs(3600), true).unwrap();
        (cache, dir)
    }

    #[test]
    fn test_key_is_deterministic_and_param_order_free() {
        let a = page_key(
            "/x",
            &[
                ("b".to_string(), "2".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
        );
        let b = page_key(
            "/x",
            &[
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ],
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, page_key("/y", &[]));
    }

    #[test]
    fn test_set_get_round_trip() {
        let (cache, _dir) = cache(10);
        let key = page_key("/x", &[]);
        cache.set(&key, b"<html>x</html>", &["b1".to_string()]).unwrap();

        assert_eq!(cache.get(&key).unwrap(), b"<html>x</html>");
        assert!(cache.get("0000000000000000").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.size_bytes, 14);
    }

    #[test]
    fn test_invalidate_block_removes_dependent_pages() {
        let (cache, _dir) = cache(10);
        let k1 = page_key("/x", &[]);
        let k2 = page_key("/y", &[]);
        let k3 = page_key("/z", &[]);
        cache.set(&k1, b"x", &["b1".to_string()]).unwrap();
        cache.set(&k2, b"y", &["b1".to_string(), "b2".to_string()]).unwrap();
        cache.set(&k3, b"z", &["b2".to_string()]).unwrap();

        assert_eq!(cache.invalidate_block("b1"), 2);
        assert!(cache.get(&k1).is_none());
        assert!(cache.get(&k2).is_none());
        assert!(cache.get(&k3).is_some());

        // Re-invalidating is a no-op.
        assert_eq!(cache.invalidate_block("b1"), 0);
    }

    #[test]
    fn test_lru_eviction_under_size_pressure() {
        let dir = TempDir::new().unwrap();
        // 1 MB budget; three ~400 KB pages force one eviction.
        let cache = PageCache::new(dir.path(), 1, Duration::from_secs(3600), true).unwrap();
        let blob = vec![b'x'; 400 * 1024];
        cache.set("aaaaaaaaaaaaaaaa", &blob, &[]).unwrap();
        cache.set("bbbbbbbbbbbbbbbb", &blob, &[]).unwrap();
        // Touch the first so the second is the LRU victim.
        assert!(cache.get("aaaaaaaaaaaaaaaa").is_some());
        cache.set("cccccccccccccccc", &blob, &[]).unwrap();

        assert!(cache.get("bbbbbbbbbbbbbbbb").is_none());
        assert!(cache.get("aaaaaaaaaaaaaaaa").is_some());
        assert!(cache.get("cccccccccccccccc").is_some());
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_size_counter_matches_files_on_disk() {
        let (cache, dir) = cache(10);
        cache.set("aaaaaaaaaaaaaaaa", b"12345", &[]).unwrap();
        cache.set("bbbbbbbbbbbbbbbb", b"123", &[]).unwrap();
        cache.invalidate_block("nope");

        let on_disk: u64 = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("html"))
            .map(|e| e.metadata().unwrap().len())
            .sum();
        assert_eq!(cache.stats().size_bytes, on_disk);
    }

    #[test]
    fn test_ttl_expiry() {
        let dir = TempDir::new().unwrap();
        let cache = PageCache::new(dir.path(), 10, Duration::from_millis(30), true).unwrap();
        cache.set("aaaaaaaaaaaaaaaa", b"x", &[]).unwrap();
        assert!(cache.get("aaaaaaaaaaaaaaaa").is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("aaaaaaaaaaaaaaaa").is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let dir = TempDir::new().unwrap();
        let cache = PageCache::new(dir.path(), 10, Duration::from_secs(3600), false).unwrap();
        cache.set("aaaaaaaaaaaaaaaa", b"x", &[]).unwrap();
        assert!(cache.get("aaaaaaaaaaaaaaaa").is_none());
    }

    #[test]
    fn test_startup_clears_stale_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("deadbeefdeadbeef.html"), b"stale").unwrap();
        let cache = PageCache::new(dir.path(), 10, Duration::from_secs(3600), true).unwrap();
        assert!(!dir.path().join("deadbeefdeadbeef.html").exists());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_clear() {
        let (cache, _dir) = cache(10);
        cache.set("aaaaaaaaaaaaaaaa", b"x", &["b1".to_string()]).unwrap();
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert_eq!(cache.stats().size_bytes, 0);
        assert!(cache.get("aaaaaaaaaaaaaaaa").is_none());
    }
}
