//! Filesystem lifecycle (spec §9 "Global state"): init (download+verify
//! metadata, seq_no dance), active (serve FUSE), shutdown (drain uploads,
//! upload metadata). `S3ql` is the explicit context threaded into every
//! layer instead of the teacher's ambient globals (spec §9, §9.D).
//!
//! Grounded on the teacher's `RFS<T>` (`src/rfs_lib/mod.rs`), which owns a
//! `DiskDriver` and exposes the handful of helper methods `fuse.rs` calls;
//! here the single disk driver is replaced by the layered
//! store/cache/block-manager/inode-layer stack, and the FUSE glue itself
//! lives in [`crate::dispatcher`].

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::block_manager::BlockManager;
use crate::cache::BlockCache;
use crate::config::{MountConfig, Parameters};
use crate::crypto::{self, MasterKey};
use crate::error::{Result, S3qlError};
use crate::inode_layer::InodeLayer;
use crate::metadata::MetadataStore;
use crate::mount_exclusion;
use crate::shutdown::ShutdownFlag;
use crate::uploader::MetadataUploader;
use backend::Backend;

const DELETE_DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct S3ql {
    pub store: Arc<MetadataStore>,
    pub inodes: InodeLayer,
    blocks: Arc<BlockManager>,
    cache: Arc<BlockCache>,
    backend: Arc<dyn Backend>,
    uploader: Arc<MetadataUploader>,
    params: Parameters,
    tunables: crate::config::Tunables,
    shutdown: Arc<ShutdownFlag>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    claimed_seq_no: Mutex<Option<u64>>,
}

impl S3ql {
    /// Opens the local metadata database and cache under `config.cache_dir`
    /// and wires the layers together. Does not talk to the backend yet —
    /// that happens in [`S3ql::on_mount`], matching the teacher's split
    /// between constructing `RFS` and actually mounting it.
    pub fn new(config: MountConfig, backend: Arc<dyn Backend>, master_key: MasterKey) -> Result<Self> {
        config.tunables.validate(&config.params)?;
        std::fs::create_dir_all(&config.cache_dir)?;
        let db_path = config.cache_dir.join("metadata.db");
        let store = Arc::new(MetadataStore::open(db_path)?);

        let cache = Arc::new(BlockCache::new(
            &config.cache_dir,
            &config.params,
            backend.clone(),
            master_key.clone(),
            config.tunables.compression_algorithm,
            config.tunables.compression_level,
            config.tunables.max_cache_entries,
            config.tunables.max_cache_size,
        )?);
        let blocks = Arc::new(BlockManager::new(store.clone(), cache.clone(), backend.clone(), &config.params));
        let inodes = InodeLayer::new(store.clone(), blocks.clone());
        let uploader = Arc::new(MetadataUploader::new(
            store.clone(),
            backend.clone(),
            master_key,
            config.tunables.compression_algorithm,
            config.tunables.compression_level,
        ));

        Ok(Self {
            store,
            inodes,
            blocks,
            cache,
            backend,
            uploader,
            params: config.params,
            tunables: config.tunables,
            shutdown: Arc::new(ShutdownFlag::new()),
            workers: Mutex::new(Vec::new()),
            claimed_seq_no: Mutex::new(None),
        })
    }

    pub fn block_size(&self) -> u64 {
        self.params.data_block_size
    }

    pub fn fs_uuid(&self) -> uuid::Uuid {
        self.params.fs_uuid
    }

    // ---- xattrs (spec §4.10's FUSE op list) ---------------------------

    pub fn get_xattr(&self, inode: i64, name: &[u8]) -> Result<Vec<u8>> {
        self.store.transaction(|tx| self.store.get_xattr(tx, inode, name))
    }

    pub fn set_xattr(&self, inode: i64, name: &[u8], value: &[u8]) -> Result<()> {
        self.store.transaction(|tx| self.store.set_xattr(tx, inode, name, value))
    }

    pub fn list_xattrs(&self, inode: i64) -> Result<Vec<Vec<u8>>> {
        self.store.transaction(|tx| self.store.list_xattrs(tx, inode))
    }

    pub fn remove_xattr(&self, inode: i64, name: &[u8]) -> Result<()> {
        self.store.transaction(|tx| self.store.remove_xattr(tx, inode, name))
    }

    // ---- mount lifecycle (spec §4.8, §4.7, §5) -------------------------

    /// Runs the mount-exclusion protocol (spec §4.8), downloads the latest
    /// metadata snapshot (spec §4.7), and starts the background upload,
    /// delete-drain and periodic-metadata-upload workers (spec §5's "fixed
    /// pool of upload threads and compression threads" plus the deferred
    /// delete queue's own drain thread).
    ///
    /// The clean-shutdown check needs the `clean_seq_no` recorded inside the
    /// metadata snapshot itself, so the snapshot has to come down before the
    /// check can run — reversing the old order (check, then download) which
    /// made the check read stale state and always pass.
    pub fn on_mount(&mut self) -> Result<()> {
        self.uploader.download_and_apply()?;

        let recorded_clean_seq_no = self
            .store
            .transaction(|tx| self.store.get_state(tx, mount_exclusion::CLEAN_SEQ_NO_KEY))?
            .map(|s| s.parse::<u64>())
            .transpose()
            .map_err(|_| S3qlError::Corruption("invalid clean_seq_no in metadata".to_string()))?;

        if mount_exclusion::highest_seq_no(&*self.backend)?.is_some()
            && !mount_exclusion::was_clean_shutdown(&*self.backend, recorded_clean_seq_no)?
        {
            return Err(S3qlError::NotClean);
        }

        let seq_no = mount_exclusion::claim_mount(&*self.backend)?;
        log::info!("claimed mount seq_no {seq_no}");
        *self.claimed_seq_no.lock() = Some(seq_no);

        let mut workers = self.workers.lock();
        for i in 0..self.tunables.upload_threads {
            let cache = self.cache.clone();
            let shutdown = self.shutdown.clone();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("s3ql-upload-{i}"))
                    .spawn(move || run_upload_worker(cache, shutdown))
                    .map_err(|e| S3qlError::Io(e.into()))?,
            );
        }
        {
            let blocks = self.blocks.clone();
            let shutdown = self.shutdown.clone();
            workers.push(
                std::thread::Builder::new()
                    .name("s3ql-delete-drain".to_string())
                    .spawn(move || blocks.run_delete_drain(&shutdown, DELETE_DRAIN_POLL_INTERVAL))
                    .map_err(|e| S3qlError::Io(e.into()))?,
            );
        }
        {
            let uploader = self.uploader.clone();
            let shutdown = self.shutdown.clone();
            let interval = self.tunables.metadata_upload_interval;
            workers.push(
                std::thread::Builder::new()
                    .name("s3ql-metadata-uploader".to_string())
                    .spawn(move || uploader.run_periodic(&shutdown, interval))
                    .map_err(|e| S3qlError::Io(e.into()))?,
            );
        }
        Ok(())
    }

    /// Processes every currently-queued upload job inline. Used as a
    /// conservative stand-in for spec §4.10's per-handle `flush`/`fsync`
    /// ("returns only after every dirty block *it owns* has an acknowledged
    /// upload"): this drains the whole queue rather than tracking which
    /// blocks belong to which open handle, which is simpler and always at
    /// least as strong as the per-handle guarantee. See DESIGN.md.
    pub fn drain_uploads_sync(&self) -> Result<()> {
        let rx = self.cache.upload_receiver();
        while let Ok(job) = rx.try_recv() {
            match self.cache.upload_one(&job) {
                Ok(()) => self.cache.ack_upload(job.block_id),
                Err(e) => {
                    self.cache.mark_errored(job.block_id, e.to_string());
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Clean unmount (spec §5, §9 "shutdown: drain uploads, upload
    /// metadata"): signals workers to stop, flushes any remaining dirty
    /// blocks, joins the workers, drains the delete queue once more, and
    /// writes the final full metadata snapshot.
    pub fn on_unmount(&mut self) -> Result<()> {
        self.shutdown.set();
        self.drain_uploads_sync()?;
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        self.blocks.drain_deletes_once(i64::MAX)?;
        if let Some(seq_no) = *self.claimed_seq_no.lock() {
            self.store.transaction(|tx| {
                self.store
                    .set_state(tx, mount_exclusion::CLEAN_SEQ_NO_KEY, &seq_no.to_string())
            })?;
        }
        self.uploader.upload_full()?;
        Ok(())
    }
}

/// Consecutive non-fatal upload failures tolerated before escalating to a
/// process-fatal shutdown (spec §7: "repeated fatal backend failures").
/// A single transient failure just errors that block's cache entry; a run
/// of them past this count means the backend itself is unhealthy rather
/// than one bad object.
const MAX_CONSECUTIVE_UPLOAD_FAILURES: u32 = 10;

fn run_upload_worker(cache: Arc<BlockCache>, shutdown: Arc<ShutdownFlag>) {
    let rx = cache.upload_receiver();
    let mut consecutive_failures = 0u32;
    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(job) => match cache.upload_one(&job) {
                Ok(()) => {
                    cache.ack_upload(job.block_id);
                    consecutive_failures = 0;
                }
                Err(e) => {
                    log::error!("upload of block {} failed: {e}", job.block_id);
                    if e.is_fatal() {
                        crate::critlog::fatal_shutdown(
                            &format!("corruption detected uploading block {}: {e}", job.block_id),
                            e.exit_code(),
                        );
                    }
                    consecutive_failures += 1;
                    cache.mark_errored(job.block_id, e.to_string());
                    if consecutive_failures >= MAX_CONSECUTIVE_UPLOAD_FAILURES {
                        crate::critlog::fatal_shutdown(
                            &format!(
                                "{consecutive_failures} consecutive upload failures, most recently: {e}"
                            ),
                            e.exit_code(),
                        );
                    }
                }
            },
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if shutdown.is_set() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

/// `mkfs.s3ql <url>` (spec §6): writes the wrapped passphrase, an empty
/// metadata snapshot, and `s3ql_seq_no_0`.
pub fn mkfs(backend: Arc<dyn Backend>, params: &Parameters, passphrase: &str) -> Result<MasterKey> {
    let master_key = MasterKey::generate();
    let wrapped = crypto::wrap_master_key(passphrase, &master_key);
    let mut blob = Vec::with_capacity(16 + crate::crypto::NONCE_LEN + wrapped.ciphertext.len());
    blob.extend_from_slice(&wrapped.salt);
    blob.extend_from_slice(&wrapped.nonce);
    blob.extend_from_slice(&wrapped.ciphertext);
    backend.put("s3ql_passphrase", &blob, &Default::default())?;

    let store = Arc::new(MetadataStore::open_in_memory()?);
    store.init_fresh()?;
    store.transaction(|tx| {
        store.set_state(tx, "label", &params.label)?;
        store.set_state(tx, "data_block_size", &params.data_block_size.to_string())?;
        store.set_state(tx, "fs_uuid", &params.fs_uuid.to_string())?;
        store.set_state(tx, mount_exclusion::CLEAN_SEQ_NO_KEY, "0")?;
        Ok(())
    })?;
    let uploader = MetadataUploader::new(
        store,
        backend.clone(),
        master_key.clone(),
        crate::config::CompressionAlgorithm::None,
        1,
    );
    uploader.upload_full()?;

    backend.put(&format!("{}0", mount_exclusion::SEQ_NO_PREFIX), &[], &Default::default())?;
    Ok(master_key)
}

/// Downloads the latest metadata snapshot into a scratch in-memory store and
/// reads back the immutable [`Parameters`] mkfs recorded (spec §3's
/// "Parameters (immutable after mkfs)"), so `mount.s3ql` knows the block
/// size and filesystem UUID before it can open the real on-disk cache.
pub fn load_params(backend: Arc<dyn Backend>, master_key: &MasterKey) -> Result<Parameters> {
    let store = Arc::new(MetadataStore::open_in_memory()?);
    let uploader = MetadataUploader::new(
        store.clone(),
        backend,
        master_key.clone(),
        crate::config::CompressionAlgorithm::None,
        1,
    );
    uploader.download_and_apply()?;
    store.transaction(|tx| {
        let label = store.get_state(tx, "label")?.unwrap_or_default();
        let data_block_size: u64 = store
            .get_state(tx, "data_block_size")?
            .ok_or_else(|| S3qlError::Corruption("missing data_block_size in metadata".to_string()))?
            .parse()
            .map_err(|_| S3qlError::Corruption("invalid data_block_size in metadata".to_string()))?;
        let fs_uuid: uuid::Uuid = store
            .get_state(tx, "fs_uuid")?
            .ok_or_else(|| S3qlError::Corruption("missing fs_uuid in metadata".to_string()))?
            .parse()
            .map_err(|_| S3qlError::Corruption("invalid fs_uuid in metadata".to_string()))?;
        Ok(Parameters::from_parts(data_block_size, label, fs_uuid))
    })
}

/// Reads and unwraps `s3ql_passphrase` with the given passphrase (spec
/// §4.2, §6).
pub fn read_master_key(backend: &dyn Backend, passphrase: &str) -> Result<MasterKey> {
    let blob = backend.get("s3ql_passphrase")?;
    if blob.len() < 16 + crate::crypto::NONCE_LEN {
        return Err(S3qlError::Corruption("s3ql_passphrase object is too short".to_string()));
    }
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&blob[0..16]);
    let mut nonce = [0u8; crate::crypto::NONCE_LEN];
    nonce.copy_from_slice(&blob[16..16 + crate::crypto::NONCE_LEN]);
    let ciphertext = blob[16 + crate::crypto::NONCE_LEN..].to_vec();
    crypto::unwrap_master_key(passphrase, &crypto::WrappedMasterKey { salt, nonce, ciphertext })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_BLOCK_SIZE, Tunables};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct MemBackend {
        objects: StdMutex<std::collections::HashMap<String, Vec<u8>>>,
    }

    impl Backend for MemBackend {
        fn lookup(&self, key: &str) -> backend::Result<Option<backend::ObjectMetadata>> {
            Ok(self.objects.lock().unwrap().get(key).map(|_| Default::default()))
        }
        fn get(&self, key: &str) -> backend::Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| backend::BackendError::NoSuchKey(key.to_string()))
        }
        fn put(&self, key: &str, body: &[u8], _metadata: &backend::ObjectMetadata) -> backend::Result<()> {
            self.objects.lock().unwrap().insert(key.to_string(), body.to_vec());
            Ok(())
        }
        fn delete(&self, key: &str) -> backend::Result<()> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }
        fn list(&self, prefix: &str) -> backend::Result<Vec<backend::ListEntry>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .map(|k| backend::ListEntry { key: k.clone() })
                .collect())
        }
        fn copy(&self, src: &str, dst: &str) -> backend::Result<()> {
            let body = self.get(src)?;
            self.put(dst, &body, &Default::default())
        }
        fn rename(&self, src: &str, dst: &str) -> backend::Result<()> {
            self.copy(src, dst)?;
            self.delete(src)
        }
        fn close(&self) -> backend::Result<()> {
            Ok(())
        }
    }

    fn new_mount(tmp: &std::path::Path, backend: Arc<dyn Backend>, master_key: &MasterKey, params: &Parameters) -> S3ql {
        let config = MountConfig {
            cache_dir: tmp.to_path_buf(),
            params: params.clone(),
            tunables: Tunables::default(),
        };
        S3ql::new(config, backend, master_key.clone()).unwrap()
    }

    /// Reproduces the crash-safety law: a mount that never shuts down
    /// cleanly (`kill -9`) must be refused by the next mount attempt until
    /// `fsck` repairs the recorded seq_no (spec §4.8).
    #[test]
    fn killed_mount_is_rejected_until_fsck_repairs_it() {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::default());
        let params = Parameters::new(DEFAULT_BLOCK_SIZE, "t".into()).unwrap();
        let master_key = mkfs(backend.clone(), &params, "pw").unwrap();

        let tmp1 = tempfile::tempdir().unwrap();
        let mut fs1 = new_mount(tmp1.path(), backend.clone(), &master_key, &params);
        fs1.on_mount().unwrap();
        // Simulate `kill -9`: on_unmount never runs, so clean_seq_no in the
        // metadata snapshot is never advanced past what mkfs recorded.

        let tmp2 = tempfile::tempdir().unwrap();
        let mut fs2 = new_mount(tmp2.path(), backend.clone(), &master_key, &params);
        let err = fs2.on_mount().unwrap_err();
        assert!(matches!(err, S3qlError::NotClean));

        // fsck's repair: re-record clean_seq_no at the backend's actual
        // highest seq-no object, then re-publish metadata.
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let uploader = MetadataUploader::new(
            store.clone(),
            backend.clone(),
            master_key.clone(),
            crate::config::CompressionAlgorithm::None,
            1,
        );
        uploader.download_and_apply().unwrap();
        let highest = mount_exclusion::highest_seq_no(&*backend).unwrap().unwrap();
        store
            .transaction(|tx| store.set_state(tx, mount_exclusion::CLEAN_SEQ_NO_KEY, &highest.to_string()))
            .unwrap();
        uploader.upload_full().unwrap();

        let tmp3 = tempfile::tempdir().unwrap();
        let mut fs3 = new_mount(tmp3.path(), backend.clone(), &master_key, &params);
        fs3.on_mount().unwrap();
    }

    #[test]
    fn clean_unmount_then_remount_succeeds() {
        let backend: Arc<dyn Backend> = Arc::new(MemBackend::default());
        let params = Parameters::new(DEFAULT_BLOCK_SIZE, "t".into()).unwrap();
        let master_key = mkfs(backend.clone(), &params, "pw").unwrap();

        let tmp1 = tempfile::tempdir().unwrap();
        let mut fs1 = new_mount(tmp1.path(), backend.clone(), &master_key, &params);
        fs1.on_mount().unwrap();
        fs1.on_unmount().unwrap();

        let tmp2 = tempfile::tempdir().unwrap();
        let mut fs2 = new_mount(tmp2.path(), backend.clone(), &master_key, &params);
        fs2.on_mount().unwrap();
    }
}
