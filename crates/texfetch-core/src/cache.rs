//! Blob cache seam and the disk-backed implementation.
//!
//! All calls are asynchronous with completion callbacks; the disk
//! implementation runs them on its own small pool so cache latency never
//! blocks a fetch state machine.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::asset::AssetId;
use crate::error_handling::{errors, FetchError};
use crate::pool::JobPool;
use crate::utils;

#[derive(Debug)]
pub enum CacheReadOutcome {
    /// Bytes from `offset`, clipped to what the cache holds. `known_total` is
    /// the asset's full size when the cache knows it (a complete entry, or a
    /// partial entry written with a known total).
    Hit {
        bytes: Vec<u8>,
        known_total: Option<usize>,
    },
    Miss,
    /// Entry failed its integrity check and has been dropped.
    Corrupt,
}

pub type CacheReadCallback = Box<dyn FnOnce(CacheReadOutcome) + Send>;
pub type CacheWriteCallback = Box<dyn FnOnce(Result<(), FetchError>) + Send>;

pub trait BlobCache: Send + Sync {
    /// Read `size` bytes at `offset`. Returns a handle for bookkeeping.
    fn read(&self, id: AssetId, offset: usize, size: usize, cb: CacheReadCallback) -> u64;
    /// Store a prefix. `file_size` follows the legacy convention: the real
    /// total for a complete asset, total + 1 (or length + 1) otherwise.
    fn write(&self, id: AssetId, bytes: Vec<u8>, file_size: usize, cb: CacheWriteCallback) -> u64;
    fn remove(&self, id: AssetId);
    /// Move a queued write ahead of the others.
    fn prioritize_write(&self, handle: u64);
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct IndexEntry {
    len: usize,
    file_size: usize,
    sha256: String,
}

struct PendingWrite {
    handle: u64,
    id: AssetId,
    bytes: Vec<u8>,
    file_size: usize,
    cb: CacheWriteCallback,
}

struct DiskInner {
    store_dir: PathBuf,
    index_path: PathBuf,
    index: Mutex<HashMap<AssetId, IndexEntry>>,
    pending_writes: Mutex<VecDeque<PendingWrite>>,
    pool: Arc<JobPool>,
    next_handle: AtomicU64,
}

/// Texture store on disk: one file per asset under `<cache>/store/`, with a
/// JSON index carrying lengths and content hashes.
#[derive(Clone)]
pub struct DiskBlobCache {
    inner: Arc<DiskInner>,
}

impl DiskBlobCache {
    pub fn new(cache_dir: Option<&str>, threads: usize) -> Result<DiskBlobCache, FetchError> {
        let base = cache_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(utils::get_cache_dir()));
        let store_dir = base.join("store");
        fs::create_dir_all(&store_dir)
            .map_err(|e| errors::io_error("create_store_dir", store_dir.to_str(), e))?;
        let index_path = base.join("store_index.json");
        let index = DiskInner::load_index(&index_path);
        Ok(DiskBlobCache {
            inner: Arc::new(DiskInner {
                store_dir,
                index_path,
                index: Mutex::new(index),
                pending_writes: Mutex::new(VecDeque::new()),
                pool: JobPool::new("texfetch-cache", threads),
                next_handle: AtomicU64::new(1),
            }),
        })
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.inner.index.lock().unwrap().contains_key(&id)
    }

    pub fn entry_len(&self, id: AssetId) -> Option<usize> {
        self.inner.index.lock().unwrap().get(&id).map(|e| e.len)
    }

    pub fn shutdown(&self) {
        self.inner.pool.shutdown();
    }
}

impl DiskInner {
    fn load_index(path: &PathBuf) -> HashMap<AssetId, IndexEntry> {
        let s = match fs::read_to_string(path) {
            Ok(x) => x,
            Err(_) => return HashMap::new(),
        };
        let raw: HashMap<String, IndexEntry> = match serde_json::from_str(&s) {
            Ok(x) => x,
            Err(_) => return HashMap::new(),
        };
        raw.into_iter()
            .filter_map(|(k, v)| k.parse::<AssetId>().ok().map(|id| (id, v)))
            .collect()
    }

    fn save_index(&self, index: &HashMap<AssetId, IndexEntry>) {
        let raw: HashMap<String, &IndexEntry> =
            index.iter().map(|(k, v)| (k.to_string(), v)).collect();
        if let Ok(s) = serde_json::to_string(&raw) {
            let _ = fs::write(&self.index_path, s);
        }
    }

    fn blob_path(&self, id: AssetId) -> PathBuf {
        self.store_dir.join(format!("{}.j2c", id))
    }

    fn hash_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    fn perform_read(&self, id: AssetId, offset: usize, size: usize) -> CacheReadOutcome {
        let entry = match self.index.lock().unwrap().get(&id).cloned() {
            Some(e) => e,
            None => return CacheReadOutcome::Miss,
        };
        let path = self.blob_path(id);
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return CacheReadOutcome::Miss,
        };
        // mmap avoids a copy for the common clipped read
        let map = match unsafe { memmap2::Mmap::map(&file) } {
            Ok(m) => m,
            Err(_) => return CacheReadOutcome::Miss,
        };
        if map.len() != entry.len || Self::hash_hex(&map) != entry.sha256 {
            drop(map);
            self.drop_entry(id);
            return CacheReadOutcome::Corrupt;
        }
        let start = offset.min(entry.len);
        let end = offset.saturating_add(size).min(entry.len);
        CacheReadOutcome::Hit {
            bytes: map[start..end].to_vec(),
            known_total: known_total_from(entry.len, entry.file_size),
        }
    }

    fn perform_write(&self, id: AssetId, bytes: &[u8], file_size: usize) -> Result<(), FetchError> {
        let path = self.blob_path(id);
        fs::write(&path, bytes)
            .map_err(|e| errors::cache_error("write_blob", Some(&id.to_string()), e))?;
        let mut index = self.index.lock().unwrap();
        index.insert(
            id,
            IndexEntry {
                len: bytes.len(),
                file_size,
                sha256: Self::hash_hex(bytes),
            },
        );
        self.save_index(&index);
        Ok(())
    }

    fn drop_entry(&self, id: AssetId) {
        let mut index = self.index.lock().unwrap();
        if index.remove(&id).is_some() {
            self.save_index(&index);
        }
        drop(index);
        let _ = fs::remove_file(self.blob_path(id));
    }
}

/// Decode the legacy file-size convention back into an explicit total:
/// equal to the length means complete; more than length + 1 means a partial
/// entry with a known total; length + 1 means the total was unknown.
fn known_total_from(len: usize, file_size: usize) -> Option<usize> {
    if file_size == len {
        Some(len)
    } else if file_size > len + 1 {
        Some(file_size - 1)
    } else {
        None
    }
}

impl BlobCache for DiskBlobCache {
    fn read(&self, id: AssetId, offset: usize, size: usize, cb: CacheReadCallback) -> u64 {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        self.inner.pool.submit(Box::new(move || {
            let outcome = inner.perform_read(id, offset, size);
            cb(outcome);
        }));
        handle
    }

    fn write(&self, id: AssetId, bytes: Vec<u8>, file_size: usize, cb: CacheWriteCallback) -> u64 {
        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        self.inner.pending_writes.lock().unwrap().push_back(PendingWrite {
            handle,
            id,
            bytes,
            file_size,
            cb,
        });
        let inner = Arc::clone(&self.inner);
        self.inner.pool.submit(Box::new(move || {
            let next = inner.pending_writes.lock().unwrap().pop_front();
            if let Some(w) = next {
                let result = inner.perform_write(w.id, &w.bytes, w.file_size);
                (w.cb)(result);
            }
        }));
        handle
    }

    fn remove(&self, id: AssetId) {
        let inner = Arc::clone(&self.inner);
        self.inner.pool.submit(Box::new(move || {
            inner.drop_entry(id);
        }));
    }

    fn prioritize_write(&self, handle: u64) {
        let mut pending = self.inner.pending_writes.lock().unwrap();
        if let Some(pos) = pending.iter().position(|w| w.handle == handle) {
            if pos > 0 {
                if let Some(w) = pending.remove(pos) {
                    pending.push_front(w);
                }
            }
        }
    }
}

/// In-memory cache: the null collaborator for tests and embedders that bring
/// their own persistence. Callbacks fire inline.
#[derive(Clone)]
pub struct MemBlobCache {
    entries: Arc<Mutex<HashMap<AssetId, (Vec<u8>, usize)>>>,
    next_handle: Arc<AtomicU64>,
}

impl Default for MemBlobCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBlobCache {
    pub fn new() -> MemBlobCache {
        MemBlobCache {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn insert(&self, id: AssetId, bytes: Vec<u8>, file_size: usize) {
        self.entries.lock().unwrap().insert(id, (bytes, file_size));
    }

    pub fn get(&self, id: AssetId) -> Option<(Vec<u8>, usize)> {
        self.entries.lock().unwrap().get(&id).cloned()
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }
}

impl BlobCache for MemBlobCache {
    fn read(&self, id: AssetId, offset: usize, size: usize, cb: CacheReadCallback) -> u64 {
        let outcome = {
            let entries = self.entries.lock().unwrap();
            match entries.get(&id) {
                None => CacheReadOutcome::Miss,
                Some((bytes, file_size)) => {
                    let start = offset.min(bytes.len());
                    let end = offset.saturating_add(size).min(bytes.len());
                    CacheReadOutcome::Hit {
                        bytes: bytes[start..end].to_vec(),
                        known_total: known_total_from(bytes.len(), *file_size),
                    }
                }
            }
        };
        cb(outcome);
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn write(&self, id: AssetId, bytes: Vec<u8>, file_size: usize, cb: CacheWriteCallback) -> u64 {
        self.entries.lock().unwrap().insert(id, (bytes, file_size));
        cb(Ok(()));
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn remove(&self, id: AssetId) {
        self.entries.lock().unwrap().remove(&id);
    }

    fn prioritize_write(&self, _handle: u64) {}
}
