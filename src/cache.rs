//! Local block cache (spec §4.5).
//!
//! Grounded on the teacher's `disk_driver::cache::CacheDiskDriver` in shape
//! only (a caching layer wrapping a slower backing store); the actual state
//! machine and LRU eviction are new since the teacher's cache is an unused
//! pass-through. The `lru` crate is already a teacher dependency
//! (`disk_driver/Cargo.toml`), so it's used here instead of hand-rolling
//! list bookkeeping.
//!
//! Cache entries are files under `<cachedir>/<fsuuid>/<block_id>`, matching
//! spec §4.5 exactly. The per-entry state machine (absent / downloading /
//! clean / dirty / uploading) is tracked in memory; `entries` maps
//! `block_id` to a `Condvar`-guarded state so concurrent readers coalesce on
//! one in-flight download (spec §4.5: "exactly one in-flight download per
//! block").

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use lru::LruCache;
use parking_lot::{Condvar, Mutex};

use crate::codec;
use crate::config::{CompressionAlgorithm, Parameters};
use crate::crypto::MasterKey;
use crate::error::{Result, S3qlError};
use backend::Backend;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Absent,
    Downloading,
    Clean,
    Dirty,
    Uploading,
    /// A background upload or download failed; surfaced to the next
    /// `fsync`/`flush` on the owning inode (spec §7).
    Errored(String),
}

struct Slot {
    state: Mutex<EntryState>,
    ready: Condvar,
}

/// One unit of write-back work: a dirty block's plaintext bytes, the hash
/// and object id metadata already assigned to it by the block manager.
pub struct UploadJob {
    pub block_id: i64,
    pub obj_id: i64,
    pub plaintext: Vec<u8>,
}

pub struct BlockCache {
    dir: PathBuf,
    backend: Arc<dyn Backend>,
    master_key: MasterKey,
    compression_algorithm: CompressionAlgorithm,
    compression_level: i32,
    max_entries: usize,
    max_size: u64,

    slots: Mutex<HashMap<i64, Arc<Slot>>>,
    lru: Mutex<LruCache<i64, u64>>,
    current_size: Mutex<u64>,
    size_available: Condvar,

    upload_tx: Sender<UploadJob>,
    upload_rx: Receiver<UploadJob>,
}

impl BlockCache {
    pub fn new(
        cache_root: &std::path::Path,
        params: &Parameters,
        backend: Arc<dyn Backend>,
        master_key: MasterKey,
        compression_algorithm: CompressionAlgorithm,
        compression_level: i32,
        max_entries: usize,
        max_size: u64,
    ) -> Result<Self> {
        let dir = cache_root.join(params.fs_uuid.to_string());
        fs::create_dir_all(&dir)?;
        let (upload_tx, upload_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            dir,
            backend,
            master_key,
            compression_algorithm,
            compression_level,
            max_entries,
            max_size,
            slots: Mutex::new(HashMap::new()),
            lru: Mutex::new(LruCache::unbounded()),
            current_size: Mutex::new(0),
            size_available: Condvar::new(),
            upload_tx,
            upload_rx,
        })
    }

    fn entry_path(&self, block_id: i64) -> PathBuf {
        self.dir.join(block_id.to_string())
    }

    fn slot_for(&self, block_id: i64) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        slots
            .entry(block_id)
            .or_insert_with(|| {
                Arc::new(Slot {
                    state: Mutex::new(EntryState::Absent),
                    ready: Condvar::new(),
                })
            })
            .clone()
    }

    /// Returns the plaintext of `block_id`, downloading and decoding it from
    /// `obj_id` on first access. Concurrent callers for the same block
    /// coalesce on the slot's condition variable (spec §4.5).
    pub fn fetch(&self, block_id: i64, obj_id: i64, expected_hash: &[u8; 32]) -> Result<Vec<u8>> {
        let slot = self.slot_for(block_id);
        let path = self.entry_path(block_id);

        let is_downloader = loop {
            let mut state = slot.state.lock();
            match &*state {
                EntryState::Clean | EntryState::Dirty | EntryState::Uploading => {
                    drop(state);
                    return fs::read(&path).map_err(S3qlError::Io);
                }
                EntryState::Errored(msg) => {
                    return Err(S3qlError::Corruption(msg.clone()));
                }
                EntryState::Downloading => {
                    slot.ready.wait(&mut state);
                    continue;
                }
                EntryState::Absent => {
                    *state = EntryState::Downloading;
                    break true;
                }
            }
        };
        debug_assert!(is_downloader);

        let key = crate::metadata::Object::backend_key(obj_id);
        let result = self
            .backend
            .get(&key)
            .map_err(S3qlError::from)
            .and_then(|bytes| codec::decode_object(&bytes, &self.master_key))
            .and_then(|(_, plaintext)| {
                let hash = *blake3::hash(&plaintext).as_bytes();
                if &hash != expected_hash {
                    return Err(S3qlError::Corruption(format!(
                        "block {block_id} hash mismatch after download"
                    )));
                }
                Ok(plaintext)
            });

        let mut state = slot.state.lock();
        match &result {
            Ok(plaintext) => {
                if let Err(e) = fs::write(&path, plaintext) {
                    *state = EntryState::Errored(e.to_string());
                    drop(state);
                    slot.ready.notify_all();
                    return Err(S3qlError::Io(e));
                }
                self.account_insert(block_id, plaintext.len() as u64);
                *state = EntryState::Clean;
            }
            Err(e) => {
                *state = EntryState::Errored(e.to_string());
            }
        }
        drop(state);
        slot.ready.notify_all();
        result
    }

    /// Writes `plaintext` into the cache as a dirty block, applying
    /// backpressure when the cache is full (spec §4.5/§5 suspension point
    /// (ii)).
    pub fn store_dirty(&self, block_id: i64, plaintext: &[u8]) -> Result<()> {
        self.wait_for_space(plaintext.len() as u64);
        let slot = self.slot_for(block_id);
        let path = self.entry_path(block_id);
        fs::write(&path, plaintext)?;
        self.account_insert(block_id, plaintext.len() as u64);
        *slot.state.lock() = EntryState::Dirty;
        Ok(())
    }

    fn wait_for_space(&self, incoming: u64) {
        let mut size = self.current_size.lock();
        while *size + incoming > self.max_size || self.lru.lock().len() >= self.max_entries {
            if !self.try_evict_one(&mut size) {
                self.size_available.wait(&mut size);
            }
        }
    }

    fn try_evict_one(&self, size: &mut u64) -> bool {
        let mut lru = self.lru.lock();
        if let Some((block_id, entry_size)) = lru.pop_lru() {
            let slot = self.slot_for(block_id);
            let mut state = slot.state.lock();
            if *state == EntryState::Clean {
                let _ = fs::remove_file(self.entry_path(block_id));
                *size = size.saturating_sub(entry_size);
                drop(state);
                self.slots.lock().remove(&block_id);
                return true;
            }
            // Not evictable right now (dirty/uploading); put it back at the
            // front so we don't spin on the same entry.
            drop(state);
            lru.put(block_id, entry_size);
        }
        false
    }

    fn account_insert(&self, block_id: i64, size: u64) {
        let mut current = self.current_size.lock();
        let mut lru = self.lru.lock();
        if let Some(old) = lru.put(block_id, size) {
            *current = current.saturating_sub(old);
        }
        *current += size;
    }

    /// Marks a block's upload as complete: it transitions uploading → clean
    /// and becomes evictable again.
    pub fn ack_upload(&self, block_id: i64) {
        let slot = self.slot_for(block_id);
        *slot.state.lock() = EntryState::Clean;
        self.size_available.notify_all();
    }

    pub fn mark_errored(&self, block_id: i64, message: String) {
        let slot = self.slot_for(block_id);
        *slot.state.lock() = EntryState::Errored(message);
    }

    /// Hands off a dirty block to the write-back pipeline (spec §4.5:
    /// `dirty --flush--> uploading`).
    pub fn enqueue_upload(&self, block_id: i64, obj_id: i64) -> Result<()> {
        let slot = self.slot_for(block_id);
        *slot.state.lock() = EntryState::Uploading;
        let plaintext = fs::read(self.entry_path(block_id))?;
        self.upload_tx
            .send(UploadJob {
                block_id,
                obj_id,
                plaintext,
            })
            .map_err(|_| S3qlError::ShuttingDown)
    }

    pub fn upload_receiver(&self) -> Receiver<UploadJob> {
        self.upload_rx.clone()
    }

    /// Encodes and uploads one dirty block (run by the upload worker
    /// threads, spec §5: "fixed pool of upload threads and compression
    /// threads").
    pub fn upload_one(&self, job: &UploadJob) -> Result<()> {
        let encoded = codec::encode_object(
            job.obj_id as u64,
            &job.plaintext,
            self.compression_algorithm,
            self.compression_level,
            &self.master_key,
        )?;
        let key = crate::metadata::Object::backend_key(job.obj_id);
        self.backend.put(&key, &encoded, &Default::default())?;
        Ok(())
    }

    /// Drops the local cache file for a block whose backend object has been
    /// deleted (called by the delete-drain worker once the backend delete
    /// succeeds).
    pub fn forget(&self, block_id: i64) {
        let _ = fs::remove_file(self.entry_path(block_id));
        self.slots.lock().remove(&block_id);
        self.lru.lock().pop(&block_id);
    }

    pub fn is_empty_dir(&self) -> bool {
        fs::read_dir(&self.dir)
            .map(|mut it| it.next().is_none())
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullBackend {
        gets: AtomicUsize,
    }

    impl Backend for NullBackend {
        fn lookup(&self, _key: &str) -> backend::Result<Option<backend::ObjectMetadata>> {
            Ok(None)
        }
        fn get(&self, _key: &str) -> backend::Result<Vec<u8>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            Err(backend::BackendError::NoSuchKey("missing".to_string()))
        }
        fn put(&self, _key: &str, _body: &[u8], _metadata: &backend::ObjectMetadata) -> backend::Result<()> {
            Ok(())
        }
        fn delete(&self, _key: &str) -> backend::Result<()> {
            Ok(())
        }
        fn list(&self, _prefix: &str) -> backend::Result<Vec<backend::ListEntry>> {
            Ok(vec![])
        }
        fn copy(&self, _src: &str, _dst: &str) -> backend::Result<()> {
            Ok(())
        }
        fn rename(&self, _src: &str, _dst: &str) -> backend::Result<()> {
            Ok(())
        }
        fn close(&self) -> backend::Result<()> {
            Ok(())
        }
    }

    fn test_params() -> Parameters {
        Parameters::new(crate::config::DEFAULT_BLOCK_SIZE, "test".to_string()).unwrap()
    }

    #[test]
    fn store_dirty_then_fetch_reads_back_without_backend_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(NullBackend { gets: AtomicUsize::new(0) });
        let cache = BlockCache::new(
            tmp.path(),
            &test_params(),
            backend,
            MasterKey::generate(),
            CompressionAlgorithm::None,
            1,
            16,
            1024 * 1024,
        )
        .unwrap();
        cache.store_dirty(1, b"hello").unwrap();
        let data = fs::read(cache.entry_path(1)).unwrap();
        assert_eq!(data, b"hello");
    }

    #[test]
    fn eviction_respects_max_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = Arc::new(NullBackend { gets: AtomicUsize::new(0) });
        let cache = BlockCache::new(
            tmp.path(),
            &test_params(),
            backend,
            MasterKey::generate(),
            CompressionAlgorithm::None,
            1,
            2,
            1024 * 1024,
        )
        .unwrap();
        cache.store_dirty(1, b"a").unwrap();
        cache.ack_upload(1);
        cache.store_dirty(2, b"b").unwrap();
        cache.ack_upload(2);
        cache.store_dirty(3, b"c").unwrap();
        cache.ack_upload(3);
        assert!(cache.lru.lock().len() <= 2);
    }
}
