//! Content-addressable store for pipeline stage outputs.
//!
//! ## Layout
//!
//! ```text
//! <root>/<scope>/<hex[0..2]>/<hex>.bin        payload
//! <root>/<scope>/<hex[0..2]>/<hex>.meta.json  EntryMetadata sidecar
//! ```
//!
//! The two-character shard keeps any single directory to at most 256
//! children per scope. Putting the scope in the path makes
//! [`ContentCache::clear`] of one stage a single `remove_dir_all`.
//!
//! ## Write protocol
//!
//! Both files are written to a temp file in the shard directory and renamed
//! into place, sidecar first. A reader that finds a payload without a
//! sidecar, or whose digest disagrees with the sidecar, treats the entry as
//! absent. Writers to the same key are serialised by a per-key async mutex;
//! writers to different keys never contend.
//!
//! ## Single flight
//!
//! [`ContentCache::claim`] hands out an exclusive guard per key. The
//! pipeline holds it across lookup, compute and `put`, so a second request
//! for the same key waits and then reads the first one's entry instead of
//! computing it again. Put and claim use separate lock tables; holding a
//! claim never blocks a `put` to the same key.
//!
//! ## Eviction
//!
//! Every hit refreshes the payload's modification time. When a `put` pushes
//! the total payload size above `max_bytes`, the least recently used entries
//! are removed until usage falls to 90 % of the bound.

mod key;

pub use key::{content_hash, StageKey, StageKeyBuilder};

use crate::error::DocQaError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::SystemTime;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

const PAYLOAD_EXT: &str = "bin";
const META_SUFFIX: &str = ".meta.json";

/// Stage tag; each tag is a sub-directory of the cache root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    Normalize,
    Extract,
    Enrich,
    Caption,
    Answer,
}

impl CacheScope {
    pub const ALL: [CacheScope; 5] = [
        CacheScope::Normalize,
        CacheScope::Extract,
        CacheScope::Enrich,
        CacheScope::Caption,
        CacheScope::Answer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheScope::Normalize => "normalize",
            CacheScope::Extract => "extract",
            CacheScope::Enrich => "enrich",
            CacheScope::Caption => "caption",
            CacheScope::Answer => "answer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|scope| scope.as_str() == s)
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which entries [`ContentCache::clear`] removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    All,
    Only(CacheScope),
}

/// Sidecar metadata stored next to every payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    pub scope: CacheScope,
    pub created_at: DateTime<Utc>,
    pub size: u64,
    pub content_type: String,
    /// Hex SHA-256 of the payload, checked on every read.
    pub sha256: String,
}

/// One cached stage output.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Vec<u8>,
    pub metadata: EntryMetadata,
}

/// Result of a successful [`ContentCache::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    /// An identical payload was already stored under the key.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: u64,
}

/// Exclusive right to compute the entry for one key; released on drop.
pub type Claim = OwnedMutexGuard<()>;

type LockTable = Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>;

/// File-system backed content cache. Cheap to share behind an `Arc`.
pub struct ContentCache {
    root: PathBuf,
    max_bytes: Option<u64>,
    key_locks: LockTable,
    claims: LockTable,
    /// Lazily computed total payload bytes; the lock also serialises eviction.
    usage: tokio::sync::Mutex<Option<u64>>,
}

impl fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("root", &self.root)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl ContentCache {
    /// Open (creating if needed) a cache rooted at `root`.
    ///
    /// `max_bytes = None` disables eviction.
    pub async fn open(
        root: impl Into<PathBuf>,
        max_bytes: Option<u64>,
    ) -> Result<Self, DocQaError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| DocQaError::cache_io(&root, e))?;
        debug!("Content cache at {}", root.display());
        Ok(Self {
            root,
            max_bytes,
            key_locks: Mutex::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            usage: tokio::sync::Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn payload_path(&self, key: &StageKey) -> PathBuf {
        self.root
            .join(key.scope().as_str())
            .join(key.shard())
            .join(format!("{}.{}", key.hex(), PAYLOAD_EXT))
    }

    fn meta_path(&self, key: &StageKey) -> PathBuf {
        self.root
            .join(key.scope().as_str())
            .join(key.shard())
            .join(format!("{}{}", key.hex(), META_SUFFIX))
    }

    /// Look up `key`. Returns `Ok(None)` on a miss or a torn entry.
    pub async fn get(&self, key: &StageKey) -> Result<Option<CacheEntry>, DocQaError> {
        let payload_path = self.payload_path(key);
        let meta_path = self.meta_path(key);

        let Some(payload) = read_optional(&payload_path).await? else {
            return Ok(None);
        };
        let Some(metadata) = read_metadata(&meta_path).await? else {
            return Ok(None);
        };

        if metadata.sha256 != content_hash(&payload) {
            warn!("Cache entry {} failed its digest check; discarding", key);
            remove_quietly(&payload_path).await;
            remove_quietly(&meta_path).await;
            self.invalidate_usage().await;
            return Ok(None);
        }

        touch(payload_path).await;
        debug!("Cache hit {} ({} bytes)", key, payload.len());
        Ok(Some(CacheEntry { payload, metadata }))
    }

    /// Store `payload` under `key`.
    ///
    /// Idempotent for identical payloads. A different payload under an
    /// existing key means two distinct computations fingerprinted the same,
    /// and fails with [`DocQaError::CacheCorruption`] instead of overwriting.
    pub async fn put(
        &self,
        key: &StageKey,
        payload: &[u8],
        content_type: &str,
    ) -> Result<PutOutcome, DocQaError> {
        let lock = lock_for(&self.key_locks, key.hex());
        let _guard = lock.lock().await;

        let payload_path = self.payload_path(key);
        let meta_path = self.meta_path(key);
        let digest = content_hash(payload);

        if let Some(existing) = read_optional(&payload_path).await? {
            let intact = matches!(
                read_metadata(&meta_path).await?,
                Some(meta) if meta.sha256 == content_hash(&existing)
            );
            if intact && existing == payload {
                touch(payload_path).await;
                return Ok(PutOutcome::AlreadyPresent);
            }
            if intact {
                return Err(DocQaError::CacheCorruption {
                    key: key.hex().to_string(),
                    scope: key.scope(),
                });
            }
            warn!("Replacing torn cache entry {}", key);
        }

        let metadata = EntryMetadata {
            key: key.hex().to_string(),
            scope: key.scope(),
            created_at: Utc::now(),
            size: payload.len() as u64,
            content_type: content_type.to_string(),
            sha256: digest,
        };
        let meta_bytes = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| DocQaError::Internal(format!("cache metadata: {e}")))?;
        let payload = payload.to_vec();
        let size = metadata.size;

        tokio::task::spawn_blocking(move || {
            write_atomic(&meta_path, &meta_bytes)?;
            write_atomic(&payload_path, &payload)
        })
        .await
        .map_err(|e| DocQaError::Internal(format!("cache write task panicked: {e}")))??;

        debug!("Cache put {} ({} bytes)", key, size);
        self.account_write(size).await?;
        Ok(PutOutcome::Written)
    }

    /// Remove every entry in `scope`. Returns the number of entries removed.
    pub async fn clear(&self, scope: ClearScope) -> Result<usize, DocQaError> {
        let mut usage = self.usage.lock().await;
        let scopes: Vec<CacheScope> = match scope {
            ClearScope::All => CacheScope::ALL.to_vec(),
            ClearScope::Only(s) => vec![s],
        };

        let mut removed = 0;
        for s in scopes {
            let dir = self.root.join(s.as_str());
            removed += scan(dir.clone()).await?.len();
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DocQaError::cache_io(dir, e)),
            }
        }
        *usage = None;
        info!("Cleared {} cache entries ({:?})", removed, scope);
        Ok(removed)
    }

    /// Count entries and payload bytes currently on disk.
    pub async fn stats(&self) -> Result<CacheStats, DocQaError> {
        let files = scan(self.root.clone()).await?;
        Ok(CacheStats {
            entries: files.len(),
            bytes: files.iter().map(|f| f.size).sum(),
        })
    }

    /// Evict least-recently-used entries until payload bytes ≤ `limit`.
    /// Returns the number of entries removed.
    pub async fn evict_to(&self, limit: u64) -> Result<usize, DocQaError> {
        let mut usage = self.usage.lock().await;
        let (removed, remaining) = self.evict_locked(limit).await?;
        *usage = Some(remaining);
        Ok(removed)
    }

    async fn evict_locked(&self, limit: u64) -> Result<(usize, u64), DocQaError> {
        let mut files = scan(self.root.clone()).await?;
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        files.sort_by_key(|f| f.accessed);

        let mut removed = 0;
        for file in files {
            if total <= limit {
                break;
            }
            remove_quietly(&file.path).await;
            let meta = file.path.with_extension("").with_extension("meta.json");
            remove_quietly(&meta).await;
            total = total.saturating_sub(file.size);
            removed += 1;
        }
        if removed > 0 {
            info!("Evicted {} cache entries; {} bytes remain", removed, total);
        }
        Ok((removed, total))
    }

    async fn account_write(&self, size: u64) -> Result<(), DocQaError> {
        let Some(max) = self.max_bytes else {
            return Ok(());
        };
        let mut usage = self.usage.lock().await;
        let current = match *usage {
            Some(bytes) => bytes + size,
            None => self.stats().await?.bytes,
        };
        if current > max {
            let target = max / 10 * 9;
            let (_, remaining) = self.evict_locked(target).await?;
            *usage = Some(remaining);
        } else {
            *usage = Some(current);
        }
        Ok(())
    }

    async fn invalidate_usage(&self) {
        *self.usage.lock().await = None;
    }

    /// Wait for exclusive use of `key`.
    ///
    /// Holders of a claim on the same key run one at a time. Dropping the
    /// claim, including by cancelling the holder, lets the next one in.
    pub async fn claim(&self, key: &StageKey) -> Claim {
        lock_for(&self.claims, &key.to_string()).lock_owned().await
    }
}

fn lock_for(table: &LockTable, name: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = match table.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(lock) = locks.get(name).and_then(Weak::upgrade) {
        return lock;
    }
    if locks.len() > 1024 {
        locks.retain(|_, weak| weak.strong_count() > 0);
    }
    let lock = Arc::new(tokio::sync::Mutex::new(()));
    locks.insert(name.to_string(), Arc::downgrade(&lock));
    lock
}

// ── File helpers ─────────────────────────────────────────────────────────

struct CachedFile {
    path: PathBuf,
    size: u64,
    accessed: SystemTime,
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, DocQaError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(DocQaError::cache_io(path, e)),
    }
}

async fn read_metadata(path: &Path) -> Result<Option<EntryMetadata>, DocQaError> {
    let Some(bytes) = read_optional(path).await? else {
        return Ok(None);
    };
    match serde_json::from_slice(&bytes) {
        Ok(meta) => Ok(Some(meta)),
        Err(e) => {
            warn!("Unreadable cache metadata {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), DocQaError> {
    let dir = path.parent().ok_or_else(|| {
        DocQaError::Internal(format!("cache path without parent: {}", path.display()))
    })?;
    std::fs::create_dir_all(dir).map_err(|e| DocQaError::cache_io(dir, e))?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| DocQaError::cache_io(dir, e))?;
    tmp.write_all(bytes).map_err(|e| DocQaError::cache_io(path, e))?;
    tmp.persist(path)
        .map_err(|e| DocQaError::cache_io(path, e.error))?;
    Ok(())
}

async fn touch(path: PathBuf) {
    let result = tokio::task::spawn_blocking(move || {
        std::fs::File::options()
            .append(true)
            .open(&path)
            .and_then(|f| f.set_modified(SystemTime::now()))
    })
    .await;
    if let Ok(Err(e)) = result {
        debug!("Could not refresh cache access time: {}", e);
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove cache file {}: {}", path.display(), e);
        }
    }
}

/// Walk `dir` for payload files.
async fn scan(dir: PathBuf) -> Result<Vec<CachedFile>, DocQaError> {
    tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        if !dir.exists() {
            return Ok(files);
        }
        for entry in walkdir::WalkDir::new(&dir) {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| dir.clone());
                DocQaError::cache_io(path, std::io::Error::other(e.to_string()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(PAYLOAD_EXT)
            {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| DocQaError::cache_io(path, std::io::Error::other(e.to_string())))?;
            files.push(CachedFile {
                path: path.to_path_buf(),
                size: meta.len(),
                accessed: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(files)
    })
    .await
    .map_err(|e| DocQaError::Internal(format!("cache scan task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(scope: CacheScope, input: &[u8]) -> StageKey {
        StageKey::builder(scope, content_hash(input)).build()
    }

    async fn cache(max: Option<u64>) -> (TempDir, ContentCache) {
        let dir = TempDir::new().unwrap();
        let cache = ContentCache::open(dir.path().join("cache"), max).await.unwrap();
        (dir, cache)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (_dir, cache) = cache(None).await;
        let k = key(CacheScope::Normalize, b"doc");
        assert!(cache.get(&k).await.unwrap().is_none());

        cache.put(&k, b"%PDF-1.7", "application/pdf").await.unwrap();
        let entry = cache.get(&k).await.unwrap().expect("hit");
        assert_eq!(entry.payload, b"%PDF-1.7");
        assert_eq!(entry.metadata.size, 8);
        assert_eq!(entry.metadata.content_type, "application/pdf");
        assert_eq!(entry.metadata.scope, CacheScope::Normalize);
    }

    #[tokio::test]
    async fn identical_put_is_a_noop() {
        let (_dir, cache) = cache(None).await;
        let k = key(CacheScope::Caption, b"img");
        assert_eq!(
            cache.put(&k, b"a chart", "text/plain").await.unwrap(),
            PutOutcome::Written
        );
        assert_eq!(
            cache.put(&k, b"a chart", "text/plain").await.unwrap(),
            PutOutcome::AlreadyPresent
        );
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn differing_put_is_corruption() {
        let (_dir, cache) = cache(None).await;
        let k = key(CacheScope::Caption, b"img");
        cache.put(&k, b"a chart", "text/plain").await.unwrap();
        let err = cache.put(&k, b"a table", "text/plain").await.unwrap_err();
        assert!(matches!(err, DocQaError::CacheCorruption { .. }), "got {err:?}");
        // Original payload untouched.
        assert_eq!(cache.get(&k).await.unwrap().unwrap().payload, b"a chart");
    }

    #[tokio::test]
    async fn concurrent_identical_puts_leave_one_entry() {
        let (_dir, cache) = cache(None).await;
        let cache = Arc::new(cache);
        let k = key(CacheScope::Extract, b"pdf");
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let k = k.clone();
                tokio::spawn(async move { cache.put(&k, b"# Title\n", "application/json").await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(cache.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn torn_payload_reads_as_absent() {
        let (_dir, cache) = cache(None).await;
        let k = key(CacheScope::Extract, b"pdf");
        cache.put(&k, b"payload", "text/plain").await.unwrap();
        std::fs::write(cache.payload_path(&k), b"payl").unwrap();

        assert!(cache.get(&k).await.unwrap().is_none());
        // A torn entry can be rewritten.
        cache.put(&k, b"payload", "text/plain").await.unwrap();
        assert!(cache.get(&k).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn payload_without_sidecar_is_rewritten() {
        let (_dir, cache) = cache(None).await;
        let k = key(CacheScope::Normalize, b"doc");
        cache.put(&k, b"%PDF-1.7", "application/pdf").await.unwrap();
        std::fs::remove_file(cache.meta_path(&k)).unwrap();
        assert!(cache.get(&k).await.unwrap().is_none());

        assert_eq!(
            cache.put(&k, b"%PDF-1.7", "application/pdf").await.unwrap(),
            PutOutcome::Written
        );
        assert_eq!(cache.get(&k).await.unwrap().unwrap().payload, b"%PDF-1.7");
    }

    #[tokio::test]
    async fn claims_on_one_key_are_exclusive() {
        let (_dir, cache) = cache(None).await;
        let cache = Arc::new(cache);
        let k = key(CacheScope::Caption, b"img");
        let other = key(CacheScope::Caption, b"other");

        let held = cache.claim(&k).await;
        // A different key is never blocked.
        drop(cache.claim(&other).await);

        let waiter = {
            let cache = Arc::clone(&cache);
            let k = k.clone();
            tokio::spawn(async move {
                let _claim = cache.claim(&k).await;
                cache.get(&k).await.unwrap().map(|e| e.payload)
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // Holding a claim does not block the holder's own put.
        cache.put(&k, b"a chart", "text/plain").await.unwrap();
        drop(held);
        assert_eq!(waiter.await.unwrap().as_deref(), Some(&b"a chart"[..]));
    }

    #[tokio::test]
    async fn clear_single_scope() {
        let (_dir, cache) = cache(None).await;
        cache
            .put(&key(CacheScope::Caption, b"1"), b"cap", "text/plain")
            .await
            .unwrap();
        cache
            .put(&key(CacheScope::Extract, b"2"), b"md", "application/json")
            .await
            .unwrap();

        let removed = cache.clear(ClearScope::Only(CacheScope::Caption)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&key(CacheScope::Caption, b"1")).await.unwrap().is_none());
        assert!(cache.get(&key(CacheScope::Extract, b"2")).await.unwrap().is_some());

        assert_eq!(cache.clear(ClearScope::All).await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap(), CacheStats::default());
    }

    #[tokio::test]
    async fn eviction_removes_least_recently_used() {
        let (_dir, cache) = cache(None).await;
        let old = key(CacheScope::Caption, b"old");
        let fresh = key(CacheScope::Caption, b"fresh");
        cache.put(&old, &[0u8; 100], "text/plain").await.unwrap();
        cache.put(&fresh, &[1u8; 100], "text/plain").await.unwrap();

        let past = SystemTime::now() - std::time::Duration::from_secs(3600);
        std::fs::File::options()
            .append(true)
            .open(cache.payload_path(&old))
            .unwrap()
            .set_modified(past)
            .unwrap();

        let removed = cache.evict_to(150).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.get(&old).await.unwrap().is_none());
        assert!(cache.get(&fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bounded_cache_evicts_on_put() {
        let (_dir, cache) = cache(Some(250)).await;
        for i in 0..5u8 {
            cache
                .put(&key(CacheScope::Caption, &[i]), &[i; 100], "text/plain")
                .await
                .unwrap();
        }
        let stats = cache.stats().await.unwrap();
        assert!(stats.bytes <= 250, "usage {} over bound", stats.bytes);
        assert!(stats.entries >= 1);
    }

    #[test]
    fn scope_round_trips_through_str() {
        for scope in CacheScope::ALL {
            assert_eq!(CacheScope::parse(scope.as_str()), Some(scope));
        }
        assert_eq!(CacheScope::parse("bogus"), None);
    }
}
