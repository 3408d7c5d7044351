//! Content-addressed on-disk cache engine.
//!
//! Entries live at `{root}/{h[0..2]}/{h}` where `h` is the SHA-256 hex digest
//! of the cache key.  Blobs are written to a temporary sibling and renamed
//! into place so a reader never observes a partially written entry.  An
//! in-memory index of sizes and access times drives eviction; it is rebuilt
//! from the directory tree when the cache is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::CacheStore;

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    size: u64,
    /// Unix milliseconds of the last recorded access.
    last_access: i64,
}

struct Inner {
    root: PathBuf,
    limit_bytes: AtomicU64,
    scan_interval_secs: AtomicU64,
    refresh_age_secs: AtomicU64,
    index: Mutex<HashMap<String, EntryMeta>>,
    tmp_seq: AtomicU64,
    rescan: Notify,
    closed: CancellationToken,
}

impl Inner {
    fn index(&self) -> MutexGuard<'_, HashMap<String, EntryMeta>> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// DiskCache
// ---------------------------------------------------------------------------

/// Disk-backed [`CacheStore`] with LRU eviction against a byte limit.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl DiskCache {
    /// Open (creating if needed) the cache rooted at `root` and start the
    /// background eviction scanner.
    pub async fn open(
        root: impl Into<PathBuf>,
        limit_bytes: u64,
        scan_interval_secs: u64,
        refresh_age_secs: u64,
    ) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache directory: {}", root.display()))?;

        let scan_root = root.clone();
        let index = tokio::task::spawn_blocking(move || load_index(&scan_root))
            .await
            .context("cache index task failed")??;

        let used: u64 = index.values().map(|m| m.size).sum();
        info!(
            root = %root.display(),
            entries = index.len(),
            used_bytes = used,
            limit_bytes,
            "disk cache opened"
        );

        let inner = Arc::new(Inner {
            root,
            limit_bytes: AtomicU64::new(limit_bytes),
            scan_interval_secs: AtomicU64::new(scan_interval_secs),
            refresh_age_secs: AtomicU64::new(refresh_age_secs),
            index: Mutex::new(index),
            tmp_seq: AtomicU64::new(0),
            rescan: Notify::new(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(run_scanner(Arc::clone(&inner)));

        Ok(Self { inner })
    }

    /// Number of indexed entries.
    pub fn entry_count(&self) -> usize {
        self.inner.index().len()
    }

    /// Total size of indexed entries in bytes.
    pub fn used_bytes(&self) -> u64 {
        self.inner.index().values().map(|m| m.size).sum()
    }

    fn touch(&self, digest: &str, size: u64) {
        let now = now_millis();
        let refresh_age_ms = (self.inner.refresh_age_secs.load(Ordering::Relaxed) as i64)
            .saturating_mul(1000);
        let mut index = self.inner.index();
        let meta = index.entry(digest.to_string()).or_insert(EntryMeta {
            size,
            last_access: now,
        });
        if now - meta.last_access >= refresh_age_ms {
            meta.last_access = now;
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for DiskCache {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let digest = key_digest(key);
        let path = entry_path(&self.inner.root, &digest);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                self.touch(&digest, data.len() as u64);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.inner.index().remove(&digest);
                Ok(None)
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to read cache entry {}", path.display()))
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let digest = key_digest(key);
        let path = entry_path(&self.inner.root, &digest);
        if let Some(shard) = path.parent() {
            tokio::fs::create_dir_all(shard)
                .await
                .with_context(|| format!("failed to create cache shard {}", shard.display()))?;
        }

        let seq = self.inner.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_file_name(format!("{digest}.tmp{}-{seq}", std::process::id()));
        tokio::fs::write(&tmp, &value)
            .await
            .with_context(|| format!("failed to write cache entry {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e)
                .with_context(|| format!("failed to publish cache entry {}", path.display()));
        }

        self.inner.index().insert(
            digest,
            EntryMeta {
                size: value.len() as u64,
                last_access: now_millis(),
            },
        );
        debug!(%key, size = value.len(), "cache entry stored");
        Ok(())
    }

    async fn update_cache_limit(&self, bytes: u64) {
        let previous = self.inner.limit_bytes.swap(bytes, Ordering::Relaxed);
        if bytes < previous {
            self.inner.rescan.notify_one();
        }
    }

    async fn update_cache_scan_interval(&self, seconds: u64) {
        let previous = self
            .inner
            .scan_interval_secs
            .swap(seconds, Ordering::Relaxed);
        if previous != seconds {
            self.inner.rescan.notify_one();
        }
    }

    async fn update_cache_refresh_age(&self, seconds: u64) {
        self.inner.refresh_age_secs.store(seconds, Ordering::Relaxed);
    }

    async fn close(&self) {
        self.inner.closed.cancel();
    }
}

// ---------------------------------------------------------------------------
// Eviction
// ---------------------------------------------------------------------------

async fn run_scanner(inner: Arc<Inner>) {
    loop {
        let interval = Duration::from_secs(inner.scan_interval_secs.load(Ordering::Relaxed).max(1));
        tokio::select! {
            () = inner.closed.cancelled() => break,
            () = inner.rescan.notified() => {}
            () = tokio::time::sleep(interval) => {}
        }
        let evicted = evict_to_limit(&inner).await;
        if evicted > 0 {
            info!(evicted, "cache scan evicted entries");
        }
    }
    debug!("disk cache scanner stopped");
}

/// Remove least-recently-accessed entries until the total size fits the
/// limit.  Returns the number of entries removed.
async fn evict_to_limit(inner: &Inner) -> usize {
    let limit = inner.limit_bytes.load(Ordering::Relaxed);
    let victims: Vec<String> = {
        let index = inner.index();
        let mut used: u64 = index.values().map(|m| m.size).sum();
        if used <= limit {
            return 0;
        }
        let mut entries: Vec<(&String, &EntryMeta)> = index.iter().collect();
        entries.sort_by_key(|(_, meta)| meta.last_access);

        let mut victims = Vec::new();
        for (digest, meta) in entries {
            if used <= limit {
                break;
            }
            used = used.saturating_sub(meta.size);
            victims.push(digest.clone());
        }
        victims
    };

    let mut evicted = 0;
    for digest in &victims {
        let path = entry_path(&inner.root, digest);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to evict cache entry");
                continue;
            }
        }
        inner.index().remove(digest);
        evicted += 1;
    }
    evicted
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn key_digest(key: &str) -> String {
    format!("{:x}", Sha256::digest(key.as_bytes()))
}

fn entry_path(root: &Path, digest: &str) -> PathBuf {
    root.join(&digest[..2]).join(digest)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Walk `{root}/{shard}/{digest}` and index every published entry.  Leftover
/// temporary files from an interrupted write are removed.
fn load_index(root: &Path) -> Result<HashMap<String, EntryMeta>> {
    let mut index = HashMap::new();

    let shards = std::fs::read_dir(root)
        .with_context(|| format!("failed to read cache directory: {}", root.display()))?;

    for shard in shards {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        let entries = match std::fs::read_dir(shard.path()) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(".tmp") {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let last_access = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);
            index.insert(
                name,
                EntryMeta {
                    size: meta.len(),
                    last_access,
                },
            );
        }
    }

    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open(dir: &Path, limit: u64) -> DiskCache {
        DiskCache::open(dir, limit, 3600, 0).await.unwrap()
    }

    #[tokio::test]
    async fn stored_entry_is_returned() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), 1 << 20).await;

        cache
            .set("/data/abc/x1.jpg", Bytes::from_static(b"image-bytes"))
            .await
            .unwrap();

        let got = cache.get("/data/abc/x1.jpg").await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"image-bytes"[..]));
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.used_bytes(), 11);
        cache.close().await;
    }

    #[tokio::test]
    async fn missing_entry_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), 1 << 20).await;
        assert!(cache.get("/data/abc/nope.png").await.unwrap().is_none());
        cache.close().await;
    }

    #[tokio::test]
    async fn overwrite_replaces_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), 1 << 20).await;
        cache.set("k", Bytes::from_static(b"first")).await.unwrap();
        cache.set("k", Bytes::from_static(b"second!")).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().unwrap(), &b"second!"[..]);
        assert_eq!(cache.used_bytes(), 7);
        cache.close().await;
    }

    #[tokio::test]
    async fn entries_survive_reopen_and_temp_files_are_cleaned() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let cache = open(tmp.path(), 1 << 20).await;
            cache.set("k", Bytes::from_static(b"persisted")).await.unwrap();
            cache.close().await;
        }

        let digest = key_digest("k");
        let stray = entry_path(tmp.path(), &digest).with_file_name(format!("{digest}.tmp1-0"));
        std::fs::write(&stray, b"partial").unwrap();

        let cache = open(tmp.path(), 1 << 20).await;
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.get("k").await.unwrap().unwrap(), &b"persisted"[..]);
        assert!(!stray.exists());
        cache.close().await;
    }

    #[tokio::test]
    async fn eviction_drops_least_recently_used() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), 25).await;
        let pause = || tokio::time::sleep(Duration::from_millis(5));

        cache.set("a", Bytes::from(vec![1u8; 10])).await.unwrap();
        pause().await;
        cache.set("b", Bytes::from(vec![2u8; 10])).await.unwrap();
        pause().await;
        assert!(cache.get("a").await.unwrap().is_some());
        pause().await;
        cache.set("c", Bytes::from(vec![3u8; 10])).await.unwrap();

        let evicted = evict_to_limit(&cache.inner).await;
        assert_eq!(evicted, 1);
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("c").await.unwrap().is_some());
        assert_eq!(cache.used_bytes(), 20);
        cache.close().await;
    }

    #[tokio::test]
    async fn shrinking_the_limit_triggers_a_scan() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(tmp.path(), 1 << 20).await;
        for key in ["a", "b", "c", "d"] {
            cache.set(key, Bytes::from(vec![0u8; 100])).await.unwrap();
        }

        cache.update_cache_limit(150).await;

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while cache.used_bytes() > 150 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(cache.used_bytes() <= 150);
        cache.close().await;
    }

    #[test]
    fn entry_path_is_sharded_by_digest_prefix() {
        let digest = key_digest("/data/0123456789abcdef0123456789abcdef/x1.jpg");
        assert_eq!(digest.len(), 64);
        let path = entry_path(Path::new("/cache"), &digest);
        assert_eq!(path, Path::new("/cache").join(&digest[..2]).join(&digest));
    }
}
